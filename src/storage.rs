//! Durable storage of small pieces of member state outside the log.
//!
//! The term and vote of a member must survive restarts so that it never votes twice in a term, and the member set a
//! member was bootstrapped with is recorded so that a second bootstrap with a different set is refused.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use uuid::Uuid;

use crate::error::{MarshalError, StorageError};
use crate::member::{MemberId, MemberSet};
use crate::Term;

/// A state value which can be written to and read from a byte channel.
pub trait StateMarshal: Sized {
    /// The state of a member which has never persisted anything.
    fn start_state() -> Self;

    fn marshal(&self, channel: &mut dyn Write) -> Result<(), MarshalError>;

    fn unmarshal(channel: &mut dyn Read) -> Result<Self, MarshalError>;
}

/// Storage of a single state value.
pub trait StateStorage<T>: Send {
    /// Returns the last persisted state, or the start state if nothing was persisted.
    fn initial_state(&self) -> T;

    /// Persists `state`, replacing the previous value. The new state is durable once this returns.
    fn persist(&mut self, state: &T) -> Result<(), StorageError>;
}

/// The term of a member and its vote in that term.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TermState {
    pub term: Term,
    pub voted_for: Option<MemberId>,
}

/// The voting member set a member was bootstrapped with, or last committed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MembershipState {
    pub members: MemberSet,
}

/// Keeps state in memory only.
#[derive(Debug, Default)]
pub struct InMemoryStateStorage<T> {
    state: T,
}

/// Keeps state in a file, replaced atomically on every write.
///
/// A write goes to a temporary file which is synced and then renamed over the previous file, so a crash leaves either
/// the old or the new state. The payload is protected by a CRC32 checksum.
#[derive(Debug)]
pub struct DurableStateStorage<T> {
    path: PathBuf,
    state: T,
}

//
// TermState impls
//

impl StateMarshal for TermState {
    fn start_state() -> Self {
        Self::default()
    }

    fn marshal(&self, channel: &mut dyn Write) -> Result<(), MarshalError> {
        channel.write_u64::<BigEndian>(self.term)?;
        match &self.voted_for {
            Some(member) => {
                channel.write_u8(1)?;
                channel.write_all(member.as_bytes())?;
            }
            None => channel.write_u8(0)?,
        }
        Ok(())
    }

    fn unmarshal(channel: &mut dyn Read) -> Result<Self, MarshalError> {
        let term = channel.read_u64::<BigEndian>()?;
        let voted_for = match channel.read_u8()? {
            0 => None,
            _ => Some(read_member(channel)?),
        };
        Ok(Self { term, voted_for })
    }
}

//
// MembershipState impls
//

impl StateMarshal for MembershipState {
    fn start_state() -> Self {
        Self::default()
    }

    fn marshal(&self, channel: &mut dyn Write) -> Result<(), MarshalError> {
        channel.write_i32::<BigEndian>(self.members.len() as i32)?;
        for member in &self.members {
            channel.write_all(member.as_bytes())?;
        }
        Ok(())
    }

    fn unmarshal(channel: &mut dyn Read) -> Result<Self, MarshalError> {
        let count = channel.read_i32::<BigEndian>()?;
        if count < 0 {
            return Err(MarshalError::NegativeLength(count));
        }
        let mut members = MemberSet::new();
        for _ in 0..count {
            members.insert(read_member(channel)?);
        }
        Ok(Self { members })
    }
}

fn read_member(channel: &mut dyn Read) -> Result<MemberId, MarshalError> {
    let mut bytes = [0; 16];
    channel.read_exact(&mut bytes)?;
    Ok(MemberId::from_uuid(Uuid::from_bytes(bytes)))
}

//
// InMemoryStateStorage impls
//

impl<T: StateMarshal> InMemoryStateStorage<T> {
    pub fn new() -> Self {
        Self {
            state: T::start_state(),
        }
    }

    pub fn with_state(state: T) -> Self {
        Self { state }
    }
}

impl<T: Clone + Send> StateStorage<T> for InMemoryStateStorage<T> {
    fn initial_state(&self) -> T {
        self.state.clone()
    }

    fn persist(&mut self, state: &T) -> Result<(), StorageError> {
        self.state = state.clone();
        Ok(())
    }
}

//
// DurableStateStorage impls
//

impl<T: StateMarshal> DurableStateStorage<T> {
    /// Opens the state stored at `path`, which need not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or fails its checksum.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let state = match File::open(&path) {
            Ok(mut file) => read_state(&path, &mut file)?,
            Err(error) if error.kind() == io::ErrorKind::NotFound => T::start_state(),
            Err(error) => return Err(error.into()),
        };
        Ok(Self { path, state })
    }
}

impl<T: StateMarshal + Clone + Send> StateStorage<T> for DurableStateStorage<T> {
    fn initial_state(&self) -> T {
        self.state.clone()
    }

    fn persist(&mut self, state: &T) -> Result<(), StorageError> {
        let mut payload = Vec::new();
        state.marshal(&mut payload)?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_u32::<BigEndian>(crc32fast::hash(&payload))?;
        file.write_u32::<BigEndian>(payload.len() as u32)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;

        debug!("persisted state to {}", self.path.display());
        self.state = state.clone();
        Ok(())
    }
}

fn read_state<T: StateMarshal>(path: &Path, file: &mut File) -> Result<T, StorageError> {
    let checksum_error = || StorageError::Checksum(path.display().to_string());
    let crc = file.read_u32::<BigEndian>().map_err(|_| checksum_error())?;
    let len = file.read_u32::<BigEndian>().map_err(|_| checksum_error())?;
    let mut payload = Vec::new();
    file.take(u64::from(len)).read_to_end(&mut payload)?;
    if payload.len() != len as usize || crc32fast::hash(&payload) != crc {
        return Err(checksum_error());
    }
    Ok(T::unmarshal(&mut payload.as_slice())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durable_term_state_survives_reopen() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("term");
        let voted = TermState {
            term: 5,
            voted_for: Some(MemberId::random()),
        };
        {
            let mut storage = DurableStateStorage::<TermState>::open(&path).unwrap();
            assert_eq!(storage.initial_state(), TermState::default());
            storage.persist(&voted).unwrap();
        }
        let storage = DurableStateStorage::<TermState>::open(&path).unwrap();
        assert_eq!(storage.initial_state(), voted);
    }

    #[test]
    fn durable_state_detects_corruption() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("membership");
        let members: MemberSet = (0..3).map(|_| MemberId::random()).collect();
        DurableStateStorage::<MembershipState>::open(&path)
            .unwrap()
            .persist(&MembershipState { members })
            .unwrap();

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 1;
        fs::write(&path, data).unwrap();
        assert!(matches!(
            DurableStateStorage::<MembershipState>::open(&path),
            Err(StorageError::Checksum(_))
        ));
    }

    #[test]
    fn in_memory_storage_keeps_last_state() {
        let mut storage = InMemoryStateStorage::<TermState>::new();
        let state = TermState { term: 2, voted_for: None };
        storage.persist(&state).unwrap();
        assert_eq!(storage.initial_state(), state);
    }
}
