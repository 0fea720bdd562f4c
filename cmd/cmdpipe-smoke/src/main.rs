//! cmdpipe end-to-end smoke test
//!
//! Talks to a running cmdpiped and checks:
//!   Part A - Basics: PING, ECHO, SET/GET/DEL, unknown commands
//!   Part B - Pipelining: FIFO replies across background SLEEPs
//!   Part C - Transactions: MULTI/EXEC/DISCARD, EXECABORT
//!   Part D - Concurrency: a slow client does not stall a fast one
//!
//! Run:
//!     ./target/release/cmdpiped 9999 &
//!     ./target/release/cmdpipe-smoke [addr]     (default 127.0.0.1:9999)

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use cmdpipe_resp::{append_command, Reply, ReplyReader};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    /// Compare a round-trip result against the expected replies.
    fn expect(&mut self, name: &str, got: std::io::Result<Vec<Reply>>, want: &[Reply]) {
        match got {
            Ok(replies) if replies == want => self.pass(name),
            Ok(replies) => self.fail(name, &format!("got {:?}", replies)),
            Err(e) => self.fail(name, &e.to_string()),
        }
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

// ── Client ──

struct Client {
    stream: TcpStream,
    reader: ReplyReader,
}

impl Client {
    fn connect(addr: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, reader: ReplyReader::new() })
    }

    /// Send every command in one write, then read one reply per command.
    fn pipeline(&mut self, cmds: &[&[&str]]) -> std::io::Result<Vec<Reply>> {
        let mut buf = Vec::new();
        for args in cmds {
            append_command(&mut buf, args);
        }
        self.stream.write_all(&buf)?;
        self.read(cmds.len())
    }

    fn call(&mut self, args: &[&str]) -> std::io::Result<Vec<Reply>> {
        self.pipeline(&[args])
    }

    fn read(&mut self, n: usize) -> std::io::Result<Vec<Reply>> {
        let mut replies = Vec::with_capacity(n);
        let mut buf = [0u8; 4096];
        while replies.len() < n {
            while let Some(reply) = self.reader.next_reply().map_err(invalid)? {
                replies.push(reply);
                if replies.len() == n {
                    return Ok(replies);
                }
            }
            let got = self.stream.read(&mut buf)?;
            if got == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            self.reader.feed(&buf[..got]);
        }
        Ok(replies)
    }
}

fn invalid(e: cmdpipe_resp::ProtocolError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

fn err(msg: &str) -> Reply {
    Reply::error(msg)
}

// ════════════════════════════════════════════════════════════
// Part A: Basics
// ════════════════════════════════════════════════════════════

fn test_basics(t: &mut TestRunner, c: &mut Client) {
    t.section("Part A: Basics");

    t.expect("PING", c.call(&["PING"]), &[Reply::pong()]);
    t.expect("PING msg", c.call(&["PING", "hello"]), &[Reply::bulk("hello")]);
    t.expect("ECHO", c.call(&["ECHO", "a b c"]), &[Reply::bulk("a b c")]);
    t.expect("SET", c.call(&["SET", "smoke:k", "v1"]), &[Reply::ok()]);
    t.expect("GET", c.call(&["GET", "smoke:k"]), &[Reply::bulk("v1")]);
    t.expect("DEL", c.call(&["DEL", "smoke:k", "smoke:none"]), &[Reply::Int(1)]);
    t.expect("GET missing", c.call(&["GET", "smoke:k"]), &[Reply::Null]);
    t.expect(
        "unknown command",
        c.call(&["NOSUCH"]),
        &[err("ERR command 'NOSUCH' not found")],
    );
    t.expect(
        "wrong arity",
        c.call(&["GET"]),
        &[err("ERR wrong number of arguments for 'get' command")],
    );
}

// ════════════════════════════════════════════════════════════
// Part B: Pipelining
// ════════════════════════════════════════════════════════════

fn test_pipelining(t: &mut TestRunner, c: &mut Client) {
    t.section("Part B: Pipelining");

    let _ = c.call(&["SET", "smoke:hi", "there"]);
    t.expect(
        "FIFO across two SLEEPs",
        c.pipeline(&[
            &["GET", "smoke:hi"],
            &["SLEEP", "50"],
            &["SLEEP", "50"],
            &["GET", "smoke:hi"],
            &["GET", "smoke:hi"],
        ]),
        &[
            Reply::bulk("there"),
            Reply::ok(),
            Reply::ok(),
            Reply::bulk("there"),
            Reply::bulk("there"),
        ],
    );

    t.expect(
        "write after SLEEP is ordered",
        c.pipeline(&[&["SLEEP", "20"], &["SET", "smoke:hi", "later"], &["GET", "smoke:hi"]]),
        &[Reply::ok(), Reply::ok(), Reply::bulk("later")],
    );

    let many: Vec<&[&str]> = vec![&["SLEEP", "1"]; 100];
    let started = Instant::now();
    let got = c.pipeline(&many);
    let all_ok = got.as_ref().map(|r| r.iter().all(|x| *x == Reply::ok())).unwrap_or(false);
    t.check(
        "100 chained SLEEPs",
        all_ok,
        &format!("{:?} after {:?}", got.err(), started.elapsed()),
    );

    t.expect(
        "inline protocol",
        {
            let sent = c.stream.write_all(b"PING\r\nECHO \"two words\"\r\n");
            sent.and_then(|_| c.read(2))
        },
        &[Reply::pong(), Reply::bulk("two words")],
    );
}

// ════════════════════════════════════════════════════════════
// Part C: Transactions
// ════════════════════════════════════════════════════════════

fn test_transactions(t: &mut TestRunner, c: &mut Client) {
    t.section("Part C: Transactions");

    t.expect(
        "MULTI/EXEC",
        c.pipeline(&[
            &["MULTI"],
            &["SET", "smoke:tx", "1"],
            &["GET", "smoke:tx"],
            &["EXEC"],
        ]),
        &[
            Reply::ok(),
            Reply::queued(),
            Reply::queued(),
            Reply::Array(vec![Reply::ok(), Reply::bulk("1")]),
        ],
    );

    t.expect(
        "MULTI/DISCARD/EXEC",
        c.pipeline(&[&["MULTI"], &["GET", "smoke:tx"], &["DISCARD"], &["EXEC"]]),
        &[Reply::ok(), Reply::queued(), Reply::ok(), err("ERR no transaction")],
    );

    t.expect(
        "nested MULTI",
        c.pipeline(&[&["MULTI"], &["MULTI"], &["DISCARD"]]),
        &[Reply::ok(), err("ERR MULTI calls can not be nested"), Reply::ok()],
    );

    t.expect(
        "EXECABORT after bad command",
        c.pipeline(&[&["MULTI"], &["NOSUCH"], &["EXEC"]]),
        &[
            Reply::ok(),
            err("ERR command 'NOSUCH' not found"),
            err("EXECABORT Transaction discarded because of previous errors."),
        ],
    );

    t.expect(
        "EXEC with SLEEP",
        c.pipeline(&[
            &["MULTI"],
            &["SLEEP", "10"],
            &["SET", "smoke:tx", "2"],
            &["EXEC"],
            &["GET", "smoke:tx"],
        ]),
        &[
            Reply::ok(),
            Reply::queued(),
            Reply::queued(),
            Reply::Array(vec![Reply::ok(), Reply::ok()]),
            Reply::bulk("2"),
        ],
    );
}

// ════════════════════════════════════════════════════════════
// Part D: Concurrency
// ════════════════════════════════════════════════════════════

fn test_concurrency(t: &mut TestRunner, addr: &str) {
    t.section("Part D: Concurrency");

    let slow = Client::connect(addr).and_then(|mut c| {
        c.stream.write_all(&{
            let mut buf = Vec::new();
            append_command(&mut buf, &["SLEEP", "500"]);
            buf
        })?;
        Ok(c)
    });
    let mut slow = match slow {
        Ok(c) => c,
        Err(e) => return t.fail("slow client connect", &e.to_string()),
    };

    let started = Instant::now();
    let fast = Client::connect(addr).and_then(|mut c| c.call(&["PING"]));
    let elapsed = started.elapsed();
    t.expect("fast client during slow SLEEP", fast, &[Reply::pong()]);
    t.check(
        "fast client not stalled",
        elapsed < Duration::from_millis(400),
        &format!("took {:?}", elapsed),
    );
    t.expect("slow client reply", slow.read(1), &[Reply::ok()]);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let addr = args.get(1).map(String::as_str).unwrap_or("127.0.0.1:9999");

    println!("cmdpipe smoke test against {}", addr);
    let mut t = TestRunner::new();

    match Client::connect(addr) {
        Ok(mut c) => {
            t.pass("connect");
            test_basics(&mut t, &mut c);
            test_pipelining(&mut t, &mut c);
            test_transactions(&mut t, &mut c);
        }
        Err(e) => t.fail("connect", &format!("{} (is cmdpiped running?)", e)),
    }
    if t.failed == 0 {
        test_concurrency(&mut t, addr);
    }

    t.summary();
    if t.failed > 0 {
        std::process::exit(1);
    }
}
