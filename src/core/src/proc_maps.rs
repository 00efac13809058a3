//! Process Memory Reader (PM): parses `/proc/<pid>/maps` to locate a named
//! shared object's load base in a running process, and to find a scratch
//! executable region to host the injection thunk.

use scopeject_common::error::CoreError;
use std::fs;

/// Lines longer than this are treated as malformed rather than silently
/// truncated or silently accepted; real `/proc/<pid>/maps` lines are a few
/// hundred bytes at most; this leaves generous headroom.
const MAX_LINE_LEN: usize = 8192;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub private: bool,
}

impl Perms {
    fn parse(field: &str) -> Self {
        let bytes = field.as_bytes();
        Perms {
            read: bytes.first() == Some(&b'r'),
            write: bytes.get(1) == Some(&b'w'),
            exec: bytes.get(2) == Some(&b'x'),
            private: bytes.get(3) == Some(&b'p'),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub perms: Perms,
    pub pathname: String,
}

/// Parse the textual contents of a `/proc/<pid>/maps` file. Tolerant of
/// arbitrary trailing columns (offset, dev, inode) and of a pathname-less
/// anonymous mapping; hard-fails on a line exceeding `MAX_LINE_LEN` rather
/// than truncating it, which would otherwise silently corrupt the
/// reported address range.
pub fn parse_maps(contents: &str) -> Result<Vec<MapEntry>, CoreError> {
    let mut entries = Vec::new();

    for line in contents.lines() {
        if line.len() > MAX_LINE_LEN {
            return Err(CoreError::ProtocolViolation(format!(
                "maps line exceeds {MAX_LINE_LEN} bytes"
            )));
        }

        let mut fields = line.split_whitespace();

        let range = fields
            .next()
            .ok_or_else(|| CoreError::ProtocolViolation("missing address range".into()))?;
        let perms = fields
            .next()
            .ok_or_else(|| CoreError::ProtocolViolation("missing perms field".into()))?;
        // offset, dev, inode: tolerated and skipped regardless of count.
        let _offset = fields.next();
        let _dev = fields.next();
        let _inode = fields.next();
        let pathname = fields.collect::<Vec<_>>().join(" ");

        let (start_str, end_str) = range
            .split_once('-')
            .ok_or_else(|| CoreError::ProtocolViolation(format!("bad address range: {range}")))?;

        let start = u64::from_str_radix(start_str, 16)
            .map_err(|e| CoreError::ProtocolViolation(format!("bad start address: {e}")))?;
        let end = u64::from_str_radix(end_str, 16)
            .map_err(|e| CoreError::ProtocolViolation(format!("bad end address: {e}")))?;

        entries.push(MapEntry {
            start,
            end,
            perms: Perms::parse(perms),
            pathname,
        });
    }

    Ok(entries)
}

fn read_maps(pid: i32) -> Result<String, CoreError> {
    fs::read_to_string(format!("/proc/{pid}/maps")).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            CoreError::PermissionDenied(format!("/proc/{pid}/maps: {e}"))
        } else {
            CoreError::NotFound(format!("/proc/{pid}/maps: {e}"))
        }
    })
}

/// Start address of the first mapping whose pathname contains
/// `name_substring`.
pub fn find_object_base(pid: i32, name_substring: &str) -> Result<u64, CoreError> {
    let maps = parse_maps(&read_maps(pid)?)?;

    maps.into_iter()
        .find(|m| m.pathname.contains(name_substring))
        .map(|m| m.start)
        .ok_or_else(|| CoreError::NotFound(format!("no mapping containing {name_substring:?}")))
}

/// Start address of the first executable mapping. The kernel permits
/// `PTRACE_POKETEXT` writes to it regardless of its file backing, so the
/// caller can stage scratch data there as long as it saves and restores
/// the bytes it overwrites.
pub fn find_free_executable_addr(pid: i32) -> Result<u64, CoreError> {
    let maps = parse_maps(&read_maps(pid)?)?;

    maps.into_iter()
        .find(|m| m.perms.exec)
        .map(|m| m.start)
        .ok_or_else(|| CoreError::NotFound("no executable mapping found".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
55a1a0a4b000-55a1a0a6e000 r-xp 00000000 fd:01 131105  /usr/bin/bash
55a1a0c7e000-55a1a0c82000 rw-p 00000000 00:00 0
7f2b1c000000-7f2b1c028000 r--p 00000000 fd:01 262169 /usr/lib/x86_64-linux-gnu/libc.so.6
7f2b1c200000-7f2b1c222000 r-xp 00000000 00:00 0
";

    #[test]
    fn parses_tolerant_of_missing_pathname() {
        let entries = parse_maps(SAMPLE).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[1].pathname, "");
        assert!(!entries[1].perms.exec);
    }

    #[test]
    fn finds_object_by_substring() {
        let entries = parse_maps(SAMPLE).unwrap();
        let libc = entries.iter().find(|e| e.pathname.contains("libc")).unwrap();
        assert_eq!(libc.start, 0x7f2b1c000000);
    }

    #[test]
    fn finds_first_executable_mapping() {
        let entries = parse_maps(SAMPLE).unwrap();
        let exec = entries.iter().find(|e| e.perms.exec).unwrap();
        assert_eq!(exec.start, 0x55a1a0a4b000);
    }

    #[test]
    fn oversized_line_is_rejected() {
        let huge = "a".repeat(MAX_LINE_LEN + 1);
        let err = parse_maps(&huge).unwrap_err();
        assert!(matches!(err, CoreError::ProtocolViolation(_)));
    }
}
