//! Cluster-wide allocation of token ids.
//!
//! Tokens map names (property keys, labels, relationship types) to small integer ids. A member creating a token
//! proposes a name together with the store command creating it through the Raft log; every member applies the
//! committed request to its [`TokenRegistry`] in log order, so all members agree on the id of every name. When two
//! members propose the same name concurrently, the request committed first wins and both proposers receive its id.

use std::fmt;

use crate::error::MarshalError;

pub mod holder;
pub mod registry;
pub mod state_machine;

pub use holder::{AtomicIdGenerator, CommandFactory, IdGenerator, ReplicatedTokenHolder};
pub use registry::TokenRegistry;
pub use state_machine::{
    create_token_command, ReplicatedTokenStateMachine, TransactionCommitProcess, TransactionToApply,
};

/// The kinds of token, each with its own id space.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TokenType {
    Property,
    Label,
    RelationshipType,
}

/// A name and the id allocated to it.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Token {
    pub name: String,
    pub id: u32,
}

impl TokenType {
    pub const ALL: [TokenType; 3] = [
        TokenType::Property,
        TokenType::Label,
        TokenType::RelationshipType,
    ];

    /// The stable ordinal used in marshalled requests.
    pub fn ordinal(self) -> i32 {
        match self {
            TokenType::Property => 0,
            TokenType::Label => 1,
            TokenType::RelationshipType => 2,
        }
    }

    pub fn from_ordinal(ordinal: i32) -> Result<Self, MarshalError> {
        match ordinal {
            0 => Ok(TokenType::Property),
            1 => Ok(TokenType::Label),
            2 => Ok(TokenType::RelationshipType),
            _ => Err(MarshalError::UnknownTokenType(ordinal)),
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenType::Property => "property",
            TokenType::Label => "label",
            TokenType::RelationshipType => "relationship type",
        };
        fmt.write_str(name)
    }
}

impl Token {
    pub fn new(name: impl Into<String>, id: u32) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}[{}]", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_are_stable() {
        for token_type in TokenType::ALL {
            assert_eq!(TokenType::from_ordinal(token_type.ordinal()).unwrap(), token_type);
        }
        assert!(matches!(
            TokenType::from_ordinal(3),
            Err(MarshalError::UnknownTokenType(3))
        ));
    }
}
