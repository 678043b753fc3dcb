use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::error::TokenError;

use super::{Token, TokenType};

/// The tokens of one [`TokenType`] known to this member.
///
/// The registry only grows while a member runs: tokens are added when token requests are applied, and
/// [`set_initial_tokens`](Self::set_initial_tokens) replaces the contents from the store on startup.
pub struct TokenRegistry {
    token_type: TokenType,
    tokens: RwLock<Tokens>,
}

#[derive(Default)]
struct Tokens {
    by_name: HashMap<String, u32>,
    by_id: BTreeMap<u32, Token>,
}

impl TokenRegistry {
    pub fn new(token_type: TokenType) -> Self {
        Self {
            token_type,
            tokens: RwLock::new(Tokens::default()),
        }
    }

    pub fn token_type(&self) -> TokenType {
        self.token_type
    }

    /// Replaces all tokens with `tokens`, which must have unique names and ids.
    pub fn set_initial_tokens(&self, tokens: impl IntoIterator<Item = Token>) -> Result<(), TokenError> {
        let mut fresh = Tokens::default();
        for token in tokens {
            fresh.insert(token)?;
        }
        *self.tokens.write() = fresh;
        Ok(())
    }

    pub fn get_id(&self, name: &str) -> Option<u32> {
        self.tokens.read().by_name.get(name).copied()
    }

    pub fn get_token(&self, id: u32) -> Result<Token, TokenError> {
        self.tokens
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or(TokenError::NotFound(id))
    }

    pub fn add(&self, token: Token) -> Result<(), TokenError> {
        self.tokens.write().insert(token)
    }

    /// The smallest id greater than every registered id.
    pub fn next_free_id(&self) -> u32 {
        self.tokens
            .read()
            .by_id
            .keys()
            .next_back()
            .map_or(0, |id| id + 1)
    }

    pub fn all_tokens(&self) -> Vec<Token> {
        self.tokens.read().by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tokens.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Tokens {
    fn insert(&mut self, token: Token) -> Result<(), TokenError> {
        if let Some(&existing) = self.by_name.get(&token.name) {
            return Err(TokenError::NonUniqueName {
                name: token.name,
                existing,
                id: token.id,
            });
        }
        if let Some(existing) = self.by_id.get(&token.id) {
            return Err(TokenError::NonUniqueId {
                id: token.id,
                existing: existing.name.clone(),
                name: token.name,
            });
        }
        self.by_name.insert(token.name.clone(), token.id);
        self.by_id.insert(token.id, token);
        Ok(())
    }
}
