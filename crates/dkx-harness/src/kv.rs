//! `{{key;value}}` line codec.
//!
//! Each line carries one key and one value slice. Values longer than the
//! slice size are split over consecutive lines with the same key; the first
//! slice shorter than the slice size ends the value, so a value whose length
//! is an exact multiple of the slice size is followed by an empty slice.

use thiserror::Error;

/// Slice size used by the on-target test host.
pub const DEFAULT_SLICE_SIZE: usize = 30;

/// Longest reassembled value accepted from a peer. A handshake value is 136
/// characters.
pub const DEFAULT_MAX_VALUE_LEN: usize = 4096;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("not a {{{{key;value}}}} line: {0:?}")]
    Malformed(String),

    #[error("slice for {key:?} has {len} characters, limit is {limit}")]
    SliceTooLong { key: String, len: usize, limit: usize },

    #[error("value for {key:?} exceeds {limit} characters")]
    ValueTooLong { key: String, limit: usize },

    #[error("value for {pending:?} interrupted by {got:?}")]
    Interleaved { pending: String, got: String },

    #[error("slice size must be greater than 0")]
    ZeroSliceSize,
}

/// One parsed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvLine {
    pub key: String,
    pub value: String,
}

impl KvLine {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Render one line, without the trailing newline.
pub fn format_line(key: &str, value: &str) -> String {
    format!("{{{{{key};{value}}}}}")
}

/// Parse one line. Surrounding whitespace and line endings are ignored.
pub fn parse_line(line: &str) -> Result<KvLine, KvError> {
    let malformed = || KvError::Malformed(line.to_string());
    let body = line
        .trim()
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .ok_or_else(malformed)?;
    let (key, value) = body.split_once(';').ok_or_else(malformed)?;
    if key.is_empty() {
        return Err(malformed());
    }
    Ok(KvLine::new(key, value))
}

/// Split `value` into slices of at most `slice_size` characters, always
/// ending with a shorter (possibly empty) slice.
pub fn slice_value(value: &str, slice_size: usize) -> Result<Vec<&str>, KvError> {
    if slice_size == 0 {
        return Err(KvError::ZeroSliceSize);
    }
    let mut slices = Vec::new();
    let mut rest = value;
    loop {
        match rest.char_indices().nth(slice_size) {
            Some((split, _)) => {
                let (head, tail) = rest.split_at(split);
                slices.push(head);
                rest = tail;
            }
            None => {
                let len = rest.chars().count();
                if len == slice_size {
                    slices.push(rest);
                    slices.push("");
                } else {
                    slices.push(rest);
                }
                return Ok(slices);
            }
        }
    }
}

/// Reassembles sliced values from consecutive lines.
#[derive(Debug)]
pub struct ValueAssembler {
    slice_size: usize,
    max_value_len: usize,
    pending: Option<KvLine>,
    pending_len: usize,
}

impl ValueAssembler {
    pub fn new(slice_size: usize) -> Result<Self, KvError> {
        Self::with_max_value_len(slice_size, DEFAULT_MAX_VALUE_LEN)
    }

    /// Assembler that gives up on values longer than `max_value_len`
    /// characters.
    pub fn with_max_value_len(slice_size: usize, max_value_len: usize) -> Result<Self, KvError> {
        if slice_size == 0 {
            return Err(KvError::ZeroSliceSize);
        }
        Ok(Self {
            slice_size,
            max_value_len,
            pending: None,
            pending_len: 0,
        })
    }

    pub fn max_value_len(&self) -> usize {
        self.max_value_len
    }

    /// Feed one line. Returns the complete value once its last slice arrives.
    ///
    /// Any error drops the partially received value.
    pub fn push(&mut self, line: KvLine) -> Result<Option<KvLine>, KvError> {
        let pending_len = std::mem::take(&mut self.pending_len);
        let len = line.value.chars().count();
        if len > self.slice_size {
            self.pending = None;
            return Err(KvError::SliceTooLong {
                key: line.key,
                len,
                limit: self.slice_size,
            });
        }
        let total = pending_len + len;
        if total > self.max_value_len {
            self.pending = None;
            return Err(KvError::ValueTooLong {
                key: line.key,
                limit: self.max_value_len,
            });
        }

        let current = match self.pending.take() {
            Some(pending) if pending.key != line.key => {
                return Err(KvError::Interleaved {
                    pending: pending.key,
                    got: line.key,
                });
            }
            Some(mut pending) => {
                pending.value.push_str(&line.value);
                pending
            }
            None => line,
        };

        if len < self.slice_size {
            return Ok(Some(current));
        }
        self.pending = Some(current);
        self.pending_len = total;
        Ok(None)
    }

    /// True while a value is partially received.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(lines: &[String], slice_size: usize) -> Vec<KvLine> {
        let mut assembler = ValueAssembler::new(slice_size).unwrap();
        let mut out = Vec::new();
        for line in lines {
            if let Some(value) = assembler.push(parse_line(line).unwrap()).unwrap() {
                out.push(value);
            }
        }
        assert!(!assembler.is_pending());
        out
    }

    fn sliced_lines(key: &str, value: &str, slice_size: usize) -> Vec<String> {
        slice_value(value, slice_size)
            .unwrap()
            .into_iter()
            .map(|slice| format_line(key, slice))
            .collect()
    }

    #[test]
    fn test_format_and_parse() {
        let line = format_line("serverVerification", "SUCCESS");
        assert_eq!(line, "{{serverVerification;SUCCESS}}");
        assert_eq!(
            parse_line(&line).unwrap(),
            KvLine::new("serverVerification", "SUCCESS")
        );
    }

    #[test]
    fn test_parse_tolerates_line_endings() {
        assert_eq!(parse_line("{{k;v}}\r\n").unwrap(), KvLine::new("k", "v"));
        assert_eq!(parse_line("{{k;}}").unwrap(), KvLine::new("k", ""));
    }

    #[test]
    fn test_parse_value_keeps_semicolons() {
        assert_eq!(parse_line("{{k;a;b}}").unwrap(), KvLine::new("k", "a;b"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for line in ["", "k;v", "{{k;v}", "{k;v}}", "{{kv}}", "{{;v}}"] {
            assert!(matches!(parse_line(line), Err(KvError::Malformed(_))), "{line:?}");
        }
    }

    #[test]
    fn test_slice_short_value() {
        assert_eq!(slice_value("abc", 30).unwrap(), vec!["abc"]);
        assert_eq!(slice_value("", 30).unwrap(), vec![""]);
    }

    #[test]
    fn test_slice_exact_multiple_adds_empty_terminator() {
        let value = "a".repeat(60);
        let slices = slice_value(&value, 30).unwrap();
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[2], "");
    }

    #[test]
    fn test_slice_handshake_payload() {
        // 100 bytes encode to 136 characters: 4 full slices and 16 left over.
        let value = "Q".repeat(136);
        let slices = slice_value(&value, DEFAULT_SLICE_SIZE).unwrap();
        assert_eq!(slices.len(), 5);
        assert_eq!(slices[4].len(), 16);
    }

    #[test]
    fn test_zero_slice_size() {
        assert_eq!(slice_value("abc", 0), Err(KvError::ZeroSliceSize));
        assert!(ValueAssembler::new(0).is_err());
    }

    #[test]
    fn test_reassemble_round_trip() {
        for len in [0usize, 1, 29, 30, 31, 60, 136] {
            let value: String = "xyz+/=".chars().cycle().take(len).collect();
            let lines = sliced_lines("deviceSignedDeviceMessage", &value, 30);
            let values = reassemble(&lines, 30);
            assert_eq!(values, vec![KvLine::new("deviceSignedDeviceMessage", value)]);
        }
    }

    #[test]
    fn test_reassemble_consecutive_values() {
        let mut lines = sliced_lines("a", &"1".repeat(45), 30);
        lines.extend(sliced_lines("b", "2", 30));
        let values = reassemble(&lines, 30);
        assert_eq!(values[0], KvLine::new("a", "1".repeat(45)));
        assert_eq!(values[1], KvLine::new("b", "2"));
    }

    #[test]
    fn test_interleaved_keys_rejected() {
        let mut assembler = ValueAssembler::new(3).unwrap();
        assert_eq!(assembler.push(KvLine::new("a", "123")).unwrap(), None);
        assert!(matches!(
            assembler.push(KvLine::new("b", "4")),
            Err(KvError::Interleaved { .. })
        ));
    }

    #[test]
    fn test_unterminated_value_is_bounded() {
        let mut assembler = ValueAssembler::with_max_value_len(30, 90).unwrap();
        let slice = "A".repeat(30);
        for _ in 0..3 {
            assert_eq!(assembler.push(KvLine::new("k", slice.as_str())).unwrap(), None);
        }
        assert_eq!(
            assembler.push(KvLine::new("k", slice.as_str())),
            Err(KvError::ValueTooLong {
                key: "k".to_string(),
                limit: 90
            })
        );
        assert!(!assembler.is_pending());

        // A fresh value starts from zero after the error.
        assert_eq!(
            assembler.push(KvLine::new("k", "short")).unwrap(),
            Some(KvLine::new("k", "short"))
        );
    }

    #[test]
    fn test_value_at_limit_accepted() {
        let mut assembler = ValueAssembler::with_max_value_len(30, 75).unwrap();
        let value = "B".repeat(75);
        let mut complete = None;
        for slice in slice_value(&value, 30).unwrap() {
            complete = assembler.push(KvLine::new("k", slice)).unwrap();
        }
        assert_eq!(complete, Some(KvLine::new("k", value)));
    }

    #[test]
    fn test_default_limit_fits_handshake_values() {
        let assembler = ValueAssembler::new(DEFAULT_SLICE_SIZE).unwrap();
        assert_eq!(assembler.max_value_len(), DEFAULT_MAX_VALUE_LEN);
        assert!(DEFAULT_MAX_VALUE_LEN >= 136);
    }

    #[test]
    fn test_oversized_slice_rejected() {
        let mut assembler = ValueAssembler::new(3).unwrap();
        assert!(matches!(
            assembler.push(KvLine::new("a", "1234")),
            Err(KvError::SliceTooLong { len: 4, limit: 3, .. })
        ));
    }
}
