//! Ordering and durability of the message log under concurrent writers

use lain::runtime::log::{HISTORY_COMMANDS, LogConfig, MessageLog};
use lain::runtime::message::parse_wire;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn fast_config() -> LogConfig {
    LogConfig {
        poll_interval_ms: 10,
        sync: false,
    }
}

#[test]
fn concurrent_appends_get_gapless_increasing_ids() {
    let temp = TempDir::new().unwrap();
    let log = Arc::new(MessageLog::open(temp.path().join("messages.log"), fast_config()).unwrap());

    let writers: Vec<_> = (0..8)
        .map(|writer| {
            let log = Arc::clone(&log);
            thread::spawn(move || {
                (0..50)
                    .map(|n| {
                        let line = format!(":w{writer}!u@h PRIVMSG #room :{writer}-{n}");
                        log.append(parse_wire(&line).unwrap()).unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut all = BTreeSet::new();
    for handle in writers {
        let ids = handle.join().unwrap();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        all.extend(ids);
    }
    assert_eq!(all, (1..=400).collect::<BTreeSet<u64>>());

    log.close(Duration::from_secs(5));

    // Commit order matches id order
    let stored: Vec<u64> = log
        .tail(1000)
        .unwrap()
        .iter()
        .rev()
        .map(|m| m.sequence_id.unwrap())
        .collect();
    assert_eq!(stored, (1..=400).collect::<Vec<u64>>());
}

#[test]
fn history_reads_are_consistent_while_writing() {
    let temp = TempDir::new().unwrap();
    let log = Arc::new(MessageLog::open(temp.path().join("messages.log"), fast_config()).unwrap());

    let writer = {
        let log = Arc::clone(&log);
        thread::spawn(move || {
            for n in 0..200 {
                log.append(parse_wire(&format!(":a!u@h PRIVMSG #room :{n}")).unwrap())
                    .unwrap();
            }
        })
    };

    for _ in 0..20 {
        let window = log.history(30, HISTORY_COMMANDS).unwrap();
        assert!(window.len() <= 30);
        let ids: Vec<u64> = window.iter().map(|m| m.sequence_id.unwrap()).collect();
        assert!(ids.windows(2).all(|pair| pair[0] == pair[1] + 1));
    }

    writer.join().unwrap();
    log.close(Duration::from_secs(5));

    let window = log.history(30, HISTORY_COMMANDS).unwrap();
    assert_eq!(window.len(), 30);
    assert_eq!(window[0].sequence_id, Some(200));
    assert_eq!(window[29].sequence_id, Some(171));
}

#[test]
fn restart_continues_numbering() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("messages.log");

    {
        let log = MessageLog::open(&path, fast_config()).unwrap();
        for n in 0..3 {
            log.append(parse_wire(&format!(":a!u@h PRIVMSG #room :{n}")).unwrap())
                .unwrap();
        }
        log.close(Duration::from_secs(5));
    }

    let log = MessageLog::open(&path, fast_config()).unwrap();
    let id = log
        .append(parse_wire(":a!u@h PRIVMSG #room :again").unwrap())
        .unwrap();
    assert_eq!(id, 4);
    log.close(Duration::from_secs(5));

    let latest = log.history(1, HISTORY_COMMANDS).unwrap();
    assert_eq!(latest[0].trailing, "again");
}
