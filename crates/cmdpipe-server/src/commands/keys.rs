use std::sync::Arc;

use cmdpipe_resp::{append_command, Reply};

use crate::command::{arity_error, Command, CommandRef};
use crate::keyspace::Keyspace;

#[derive(Debug, Clone)]
pub struct Get {
    keyspace: Arc<Keyspace>,
    pub key: Vec<u8>,
}

impl Get {
    pub fn prototype(keyspace: &Arc<Keyspace>) -> Self {
        Self { keyspace: Arc::clone(keyspace), key: Vec::new() }
    }
}

impl Command for Get {
    fn name(&self) -> &str {
        "GET"
    }

    fn parse(&self, args: &[&[u8]]) -> CommandRef {
        match args {
            [_, key] => Arc::new(Get { keyspace: Arc::clone(&self.keyspace), key: key.to_vec() }),
            _ => arity_error(self.name()),
        }
    }

    fn marshal(&self, buf: &mut Vec<u8>) {
        append_command(buf, &[&b"GET"[..], &self.key]);
    }

    fn handle(&self) -> Option<Reply> {
        Some(match self.keyspace.get(&self.key) {
            Some(value) => Reply::Bulk(value),
            None => Reply::Null,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Set {
    keyspace: Arc<Keyspace>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Set {
    pub fn prototype(keyspace: &Arc<Keyspace>) -> Self {
        Self { keyspace: Arc::clone(keyspace), key: Vec::new(), value: Vec::new() }
    }
}

impl Command for Set {
    fn name(&self) -> &str {
        "SET"
    }

    fn is_change(&self) -> bool {
        true
    }

    fn parse(&self, args: &[&[u8]]) -> CommandRef {
        match args {
            [_, key, value] => Arc::new(Set {
                keyspace: Arc::clone(&self.keyspace),
                key: key.to_vec(),
                value: value.to_vec(),
            }),
            _ => arity_error(self.name()),
        }
    }

    fn marshal(&self, buf: &mut Vec<u8>) {
        append_command(buf, &[&b"SET"[..], &self.key, &self.value]);
    }

    fn handle(&self) -> Option<Reply> {
        self.keyspace.set(&self.key, &self.value);
        Some(Reply::ok())
    }
}

#[derive(Debug, Clone)]
pub struct Del {
    keyspace: Arc<Keyspace>,
    pub keys: Vec<Vec<u8>>,
}

impl Del {
    pub fn prototype(keyspace: &Arc<Keyspace>) -> Self {
        Self { keyspace: Arc::clone(keyspace), keys: Vec::new() }
    }
}

impl Command for Del {
    fn name(&self) -> &str {
        "DEL"
    }

    fn is_change(&self) -> bool {
        true
    }

    fn parse(&self, args: &[&[u8]]) -> CommandRef {
        if args.len() < 2 {
            return arity_error(self.name());
        }
        Arc::new(Del {
            keyspace: Arc::clone(&self.keyspace),
            keys: args[1..].iter().map(|k| k.to_vec()).collect(),
        })
    }

    fn marshal(&self, buf: &mut Vec<u8>) {
        let mut args: Vec<&[u8]> = vec![b"DEL"];
        args.extend(self.keys.iter().map(Vec::as_slice));
        append_command(buf, &args);
    }

    fn handle(&self) -> Option<Reply> {
        Some(Reply::Int(self.keyspace.del(&self.keys) as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::execute;

    #[test]
    fn test_set_get_del() {
        let ks = Arc::new(Keyspace::new());
        let set = Set::prototype(&ks).parse(&[b"SET", b"k", b"v"]);
        assert!(set.is_change());
        assert_eq!(execute(&*set), Reply::ok());

        let get = Get::prototype(&ks).parse(&[b"GET", b"k"]);
        assert_eq!(execute(&*get), Reply::bulk("v"));

        let del = Del::prototype(&ks).parse(&[b"DEL", b"k", b"nope"]);
        assert_eq!(execute(&*del), Reply::Int(1));
        assert_eq!(execute(&*get), Reply::Null);
    }

    #[test]
    fn test_arity() {
        let ks = Arc::new(Keyspace::new());
        assert!(Get::prototype(&ks).parse(&[b"GET"]).is_error());
        assert!(Set::prototype(&ks).parse(&[b"SET", b"k"]).is_error());
        assert!(Del::prototype(&ks).parse(&[b"DEL"]).is_error());
    }

    #[test]
    fn test_marshal_parses_back() {
        let ks = Arc::new(Keyspace::new());
        let set = Set::prototype(&ks).parse(&[b"SET", b"key", b"a b"]);
        let mut buf = Vec::new();
        set.marshal(&mut buf);
        let frame = cmdpipe_resp::parse_next(&buf).unwrap().unwrap();
        assert_eq!(frame.arg_slices(), vec![&b"SET"[..], b"key", b"a b"]);
    }
}
