use bytes::Bytes;

use crate::error::LogError;
use crate::Index;

use super::{LogEntry, RaftLog};

/// Defines test functions for a type implementing RaftLog.
#[macro_export]
macro_rules! raft_log_tests {
    ($ty:ty, $new:expr) => {
        $crate::raft_log_test! { $ty, $new, test_log_empty }
        $crate::raft_log_test! { $ty, $new, test_log_append }
        $crate::raft_log_test! { $ty, $new, test_log_non_contiguous_append }
        $crate::raft_log_test! { $ty, $new, test_log_read_range }
        $crate::raft_log_test! { $ty, $new, test_log_truncate }
        $crate::raft_log_test! { $ty, $new, test_log_truncate_committed }
        $crate::raft_log_test! { $ty, $new, test_log_commit_beyond_append }
    };
}

/// Defines a given test function for a type implementing RaftLog.
#[macro_export]
macro_rules! raft_log_test {
    ($ty:ty, $new:expr, $test:ident) => {
        #[test]
        fn $test() {
            let mut log: $ty = $new;
            $crate::log::tests::$test(&mut log);
        }
    };
}

pub fn test_log_empty<L: RaftLog>(log: &mut L) {
    verify_log(log, &[], -1);
    assert_eq!(log.commit_index(), -1);
}

pub fn test_log_append<L: RaftLog>(log: &mut L) {
    let entries = test_entries();
    for (index, entry) in entries.iter().cloned().enumerate() {
        log.append(index as Index, entry).unwrap();
        verify_log(log, &entries, index as Index);
    }
}

pub fn test_log_non_contiguous_append<L: RaftLog>(log: &mut L) {
    let entries = test_entries();
    assert!(matches!(
        log.append(1, entries[0].clone()),
        Err(LogError::NonContiguous {
            index: 1,
            append_index: -1
        })
    ));
    append_test_entries(log);
    assert!(log.append(2, entries[0].clone()).is_err());
    verify_log(log, &entries, entries.len() as Index - 1);
}

pub fn test_log_read_range<L: RaftLog>(log: &mut L) {
    let entries = append_test_entries(log);
    assert_eq!(log.read(1, 2).unwrap(), &entries[1..3]);
    assert_eq!(log.read(3, 100).unwrap(), &entries[3..]);
    assert!(log.read(entries.len() as Index, 10).unwrap().is_empty());
    assert_eq!(log.read_entry(4).unwrap().as_ref(), Some(&entries[4]));
}

pub fn test_log_truncate<L: RaftLog>(log: &mut L) {
    let entries = append_test_entries(log);
    assert!(log.truncate(entries.len() as Index).is_err());

    assert_eq!(log.truncate(3).unwrap(), 2);
    verify_log(log, &entries, 2);

    let replacement = LogEntry::new(11, Bytes::from_static(b"replacement"));
    log.append(3, replacement.clone()).unwrap();
    assert_eq!(log.append_index(), 3);
    assert_eq!(log.read_entry(3).unwrap(), Some(replacement));
    assert_eq!(log.read_term(3).unwrap(), Some(11));
    assert_eq!(log.last_term().unwrap(), 11);
}

pub fn test_log_truncate_committed<L: RaftLog>(log: &mut L) {
    let entries = append_test_entries(log);
    log.commit(2).unwrap();
    assert_eq!(log.commit_index(), 2);
    assert!(matches!(
        log.truncate(2),
        Err(LogError::TruncateCommitted {
            from: 2,
            commit_index: 2
        })
    ));
    verify_log(log, &entries, entries.len() as Index - 1);
    assert_eq!(log.truncate(3).unwrap(), 2);
}

pub fn test_log_commit_beyond_append<L: RaftLog>(log: &mut L) {
    append_test_entries(log);
    assert!(log.commit(5).is_err());
    log.commit(4).unwrap();
    log.commit(1).unwrap();
    assert_eq!(log.commit_index(), 4);
}

//
// internal
//

fn test_entries() -> [LogEntry; 5] {
    [
        LogEntry::new(0, Bytes::from_static(&[])),
        LogEntry::new(1, Bytes::from_static(&[2; 1])),
        LogEntry::new(1, Bytes::from_static(&[3; 2])),
        LogEntry::new(2, Bytes::from_static(&[4; 100])),
        LogEntry::new(9, Bytes::from_static(&[5; 100])),
    ]
}

fn append_test_entries<L: RaftLog>(log: &mut L) -> [LogEntry; 5] {
    let entries = test_entries();
    for (index, entry) in entries.iter().cloned().enumerate() {
        log.append(index as Index, entry).unwrap();
    }
    log.sync().unwrap();
    entries
}

fn verify_log<L: RaftLog>(log: &mut L, entries: &[LogEntry], append_index: Index) {
    assert_eq!(log.append_index(), append_index);
    assert_eq!(log.read_term(-1).unwrap(), Some(0));
    assert_eq!(
        log.last_term().unwrap(),
        usize::try_from(append_index)
            .map(|index| entries[index].term)
            .unwrap_or_default()
    );

    for (index, entry) in entries.iter().enumerate() {
        let index = index as Index;
        if index <= append_index {
            assert_eq!(log.read_term(index).unwrap(), Some(entry.term));
            assert_eq!(log.read_entry(index).unwrap().as_ref(), Some(entry));
        } else {
            assert_eq!(log.read_term(index).unwrap(), None);
            assert_eq!(log.read_entry(index).unwrap(), None);
        }
    }
}
