//! Command scripts run by every rank of the group.
//!
//! One command per line, `#` starts a comment. `{rank}` in keys and values
//! is replaced by the rank running the script, so the same script can give
//! every rank its own keys.
//!
//! ```text
//! put <key> <value>
//! bput <key>=<value> ...
//! get <key>
//! bget <key> ...
//! getop <eq|next|prev|first|last> <key|-> <count>
//! del <key>
//! bdel <key> ...
//! commit
//! flush
//! ```
//!
//! `flush` is collective: every rank has to reach it.
use rangestore::{BulkGetResult, Error, GetOp, Index, KeyType, Receipt, Result, Store};
use std::fs;

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Put(String, String),
    BulkPut(Vec<(String, String)>),
    Get(String),
    BulkGet(Vec<String>),
    GetOp(GetOp, Option<String>, u32),
    Del(String),
    BulkDel(Vec<String>),
    Commit,
    Flush,
}

fn invalid(line: &str) -> Error {
    Error::Config(format!("invalid command {:?}", line))
}

fn parse_op(op: &str) -> Option<GetOp> {
    match op {
        "eq" => Some(GetOp::Equal),
        "next" => Some(GetOp::Next),
        "prev" => Some(GetOp::Prev),
        "first" => Some(GetOp::First),
        "last" => Some(GetOp::Last),
        _ => None,
    }
}

pub fn parse(line: &str) -> Result<Option<Command>> {
    let line = line.split('#').next().unwrap_or("").trim();
    let mut words = line.split_whitespace();
    let name = match words.next() {
        Some(name) => name,
        None => return Ok(None),
    };
    let args: Vec<String> = words.map(str::to_string).collect();

    let command = match (name, args.len()) {
        ("put", 2) => Command::Put(args[0].clone(), args[1].clone()),
        ("bput", n) if n > 0 => {
            let mut records = Vec::with_capacity(n);
            for arg in &args {
                let mut parts = arg.splitn(2, '=');
                match (parts.next(), parts.next()) {
                    (Some(key), Some(value)) => records.push((key.to_string(), value.to_string())),
                    _ => return Err(invalid(line)),
                }
            }
            Command::BulkPut(records)
        }
        ("get", 1) => Command::Get(args[0].clone()),
        ("bget", n) if n > 0 => Command::BulkGet(args),
        ("getop", 3) => {
            let op = parse_op(&args[0]).ok_or_else(|| invalid(line))?;
            let key = if args[1] == "-" {
                None
            } else {
                Some(args[1].clone())
            };
            let count = args[2].parse().map_err(|_| invalid(line))?;
            Command::GetOp(op, key, count)
        }
        ("del", 1) => Command::Del(args[0].clone()),
        ("bdel", n) if n > 0 => Command::BulkDel(args),
        ("commit", 0) => Command::Commit,
        ("flush", 0) => Command::Flush,
        _ => return Err(invalid(line)),
    };
    Ok(Some(command))
}

pub fn load(path: &str) -> Result<Vec<Command>> {
    let contents = fs::read_to_string(path)?;
    let mut commands = Vec::new();
    for line in contents.lines() {
        if let Some(command) = parse(line)? {
            commands.push(command);
        }
    }
    Ok(commands)
}

struct Runner<'a> {
    store: &'a Store,
    key_type: KeyType,
}

impl<'a> Runner<'a> {
    fn text(&self, s: &str) -> String {
        s.replace("{rank}", &self.store.rank().to_string())
    }

    fn key(&self, s: &str) -> Result<bytes::Bytes> {
        self.key_type.parse(&self.text(s))
    }

    fn value(&self, s: &str) -> bytes::Bytes {
        bytes::Bytes::from(self.text(s).into_bytes())
    }

    fn show(&self, key: &[u8]) -> String {
        self.key_type.format(key)
    }

    fn report(&self, name: &str, receipts: &[Receipt]) -> bool {
        let failed: Vec<_> = receipts.iter().filter(|r| !r.error.is_success()).collect();
        if failed.is_empty() {
            println!("rank {}: {} ok", self.store.rank(), name);
            true
        } else {
            for r in failed {
                println!(
                    "rank {}: {} failed on rank {} with {:?}",
                    self.store.rank(),
                    name,
                    r.rank,
                    r.error
                );
            }
            false
        }
    }

    fn print_records(&self, name: &str, results: &[BulkGetResult]) -> bool {
        let mut ok = true;
        for result in results {
            for (key, value) in result.found() {
                println!(
                    "rank {}: {} {} = {}",
                    self.store.rank(),
                    name,
                    self.show(key),
                    String::from_utf8_lossy(value)
                );
            }
            ok &= result.error.is_success();
        }
        ok
    }

    async fn run(&self, index: &Index, command: Command) -> Result<bool> {
        let router = self.store.router();
        let ok = match command {
            Command::Put(key, value) => {
                let receipt = router.put(index, self.key(&key)?, self.value(&value)).await?;
                self.report("put", &[receipt])
            }
            Command::BulkPut(records) => {
                let mut encoded = Vec::with_capacity(records.len());
                for (key, value) in records {
                    encoded.push((self.key(&key)?, self.value(&value)));
                }
                let receipts = router.bput(index, encoded).await?;
                self.report("bput", &receipts)
            }
            Command::Get(key) => {
                let found = router.get(index, GetOp::Equal, Some(self.key(&key)?)).await?;
                match (found.key, found.value) {
                    (Some(key), Some(value)) => println!(
                        "rank {}: get {} = {}",
                        self.store.rank(),
                        self.show(&key),
                        String::from_utf8_lossy(&value)
                    ),
                    _ => println!("rank {}: get {:?}", self.store.rank(), found.error),
                }
                found.error.is_success()
            }
            Command::BulkGet(keys) => {
                let keys = keys
                    .iter()
                    .map(|k| self.key(k))
                    .collect::<Result<Vec<_>>>()?;
                let results = router.bget(index, GetOp::Equal, keys).await?;
                self.print_records("bget", &results)
            }
            Command::GetOp(op, key, count) => {
                let key = key.map(|k| self.key(&k)).transpose()?;
                let result = router.bget_op(index, op, key, count).await?;
                self.print_records("getop", &[result])
            }
            Command::Del(key) => {
                let receipt = router.del(index, self.key(&key)?).await?;
                self.report("del", &[receipt])
            }
            Command::BulkDel(keys) => {
                let keys = keys
                    .iter()
                    .map(|k| self.key(k))
                    .collect::<Result<Vec<_>>>()?;
                let receipts = router.bdel(index, keys).await?;
                self.report("bdel", &receipts)
            }
            Command::Commit => {
                let receipts = router.commit(index).await?;
                self.report("commit", &receipts)
            }
            Command::Flush => {
                self.store.stat_flush(index).await?;
                println!(
                    "rank {}: flush ok, {} stat rows",
                    self.store.rank(),
                    index.stat_rows().len()
                );
                true
            }
        };
        Ok(ok)
    }
}

/// Runs `commands` against the primary index and returns how many failed.
pub async fn run(store: &Store, commands: Vec<Command>) -> usize {
    let runner = Runner {
        store,
        key_type: store.options().key_type,
    };
    let index = store.primary().clone();

    let mut failed = 0;
    for command in commands {
        debug!("Rank {} running {:?}", store.rank(), command);
        match runner.run(&index, command).await {
            Ok(true) => {}
            Ok(false) => failed += 1,
            Err(e) => {
                println!("rank {}: error: {}", store.rank(), e);
                failed += 1;
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_commands() {
        assert_eq!(None, parse("   # nothing").unwrap());
        assert_eq!(
            Some(Command::Put("1".to_string(), "one".to_string())),
            parse("put 1 one").unwrap()
        );
        assert_eq!(
            Some(Command::BulkPut(vec![
                ("1".to_string(), "a".to_string()),
                ("2".to_string(), "b=c".to_string()),
            ])),
            parse("bput 1=a 2=b=c").unwrap()
        );
        assert_eq!(
            Some(Command::GetOp(GetOp::First, None, 5)),
            parse("getop first - 5 # from the start").unwrap()
        );
        assert_eq!(Some(Command::Flush), parse("flush").unwrap());
    }

    #[test]
    fn reject_malformed() {
        assert!(parse("put 1").is_err());
        assert!(parse("bput 1").is_err());
        assert!(parse("getop sideways 1 2").is_err());
        assert!(parse("frobnicate").is_err());
    }
}
