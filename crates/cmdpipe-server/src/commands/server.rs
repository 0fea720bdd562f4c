use std::sync::Arc;

use cmdpipe_resp::{append_command, Reply};

use crate::command::{arity_error, Command, CommandRef};

#[derive(Debug, Clone, Default)]
pub struct Ping {
    pub message: Option<Vec<u8>>,
}

impl Command for Ping {
    fn name(&self) -> &str {
        "PING"
    }

    fn parse(&self, args: &[&[u8]]) -> CommandRef {
        match args {
            [_] => Arc::new(Ping { message: None }),
            [_, msg] => Arc::new(Ping { message: Some(msg.to_vec()) }),
            _ => arity_error(self.name()),
        }
    }

    fn marshal(&self, buf: &mut Vec<u8>) {
        match &self.message {
            Some(msg) => append_command(buf, &[&b"PING"[..], msg]),
            None => append_command(buf, &[b"PING"]),
        }
    }

    fn handle(&self) -> Option<Reply> {
        Some(match &self.message {
            Some(msg) => Reply::bulk(msg.clone()),
            None => Reply::pong(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Echo {
    pub message: Vec<u8>,
}

impl Command for Echo {
    fn name(&self) -> &str {
        "ECHO"
    }

    fn parse(&self, args: &[&[u8]]) -> CommandRef {
        match args {
            [_, msg] => Arc::new(Echo { message: msg.to_vec() }),
            _ => arity_error(self.name()),
        }
    }

    fn marshal(&self, buf: &mut Vec<u8>) {
        append_command(buf, &[&b"ECHO"[..], &self.message]);
    }

    fn handle(&self) -> Option<Reply> {
        Some(Reply::bulk(self.message.clone()))
    }
}
