use std::sync::Arc;
use std::time::Duration;

use cmdpipe_resp::{append_command, Reply};

use crate::command::{arity_error, Command, CommandRef, Immediate};

const DEFAULT_SLEEP_MS: u64 = 1000;

/// Blocks its worker for `millis`, then replies `OK`.
#[derive(Debug, Clone)]
pub struct Sleep {
    pub millis: u64,
}

impl Default for Sleep {
    fn default() -> Self {
        Self { millis: DEFAULT_SLEEP_MS }
    }
}

impl Command for Sleep {
    fn name(&self) -> &str {
        "SLEEP"
    }

    fn is_worker(&self) -> bool {
        true
    }

    fn parse(&self, args: &[&[u8]]) -> CommandRef {
        match args {
            [_] => Arc::new(Sleep::default()),
            [_, ms] => match std::str::from_utf8(ms).ok().and_then(|s| s.parse().ok()) {
                Some(millis) => Arc::new(Sleep { millis }),
                None => Immediate::error("ERR value is not an integer or out of range"),
            },
            _ => arity_error(self.name()),
        }
    }

    fn marshal(&self, buf: &mut Vec<u8>) {
        append_command(buf, &[b"SLEEP".to_vec(), self.millis.to_string().into_bytes()]);
    }

    fn handle(&self) -> Option<Reply> {
        std::thread::sleep(Duration::from_millis(self.millis));
        Some(Reply::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let proto = Sleep::default();
        let cmd = proto.parse(&[b"SLEEP", b"5"]);
        assert!(cmd.is_worker());
        assert_eq!(cmd.handle(), Some(Reply::ok()));

        let bad = proto.parse(&[b"SLEEP", b"soon"]);
        assert!(bad.is_error());
        assert!(!bad.is_worker());
    }
}
