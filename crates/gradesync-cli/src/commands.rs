use std::fmt;
use std::fs;

use gradesync::{history_path, log_path, Key, ReplicaSet};

use crate::config::Config;

type Result = std::result::Result<(), Box<dyn std::error::Error>>;

/// One harness instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `SYSTEM.GET(student,course)`
    Get {
        /// Replica to read from.
        system: String,
        /// Record to read.
        key: Key,
    },
    /// `SYSTEM.SET((student,course), grade)`
    Set {
        /// Replica to write to.
        system: String,
        /// Record to write.
        key: Key,
        /// New grade.
        value: String,
    },
    /// `SYSTEM.MERGE(other)`
    Merge {
        /// Replica pulling changes.
        system: String,
        /// Replica the changes come from.
        peer: String,
    },
}

/// A script line that is not a valid instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseError {}

/// Drop an optional leading `<timestamp>,` from a script line.
///
/// The timestamp is informational only. A comma inside the instruction
/// (as in `SET((s,c), g)`) is not mistaken for the separator.
pub fn strip_timestamp(line: &str) -> &str {
    match line.split_once(',') {
        Some((head, rest)) if !head.contains('(') => rest.trim(),
        _ => line.trim(),
    }
}

fn call<'a>(op: &'a str, name: &str) -> Option<&'a str> {
    let rest = op.strip_prefix(name)?.trim_start();
    rest.strip_prefix('(')?.strip_suffix(')')
}

impl Command {
    /// Parse one instruction, without its timestamp prefix.
    pub fn parse(cmd: &str) -> std::result::Result<Self, ParseError> {
        let invalid = |why: &str| ParseError(format!("{why}: {cmd}"));

        let (system, op) = cmd
            .split_once('.')
            .ok_or_else(|| invalid("invalid command format"))?;
        let system = system.trim().to_lowercase();
        if system.is_empty() {
            return Err(invalid("missing system name"));
        }
        let op = op.trim();
        let upper = op.to_ascii_uppercase();

        if upper.starts_with("GET") {
            let args = call(op, &op[..3]).ok_or_else(|| invalid("invalid GET command"))?;
            let key = Key::parse(args).map_err(|e| invalid(&format!("invalid GET command ({e})")))?;
            Ok(Self::Get { system, key })
        } else if upper.starts_with("SET") {
            let args = call(op, &op[..3]).ok_or_else(|| invalid("invalid SET command"))?;
            let (key, value) = args
                .trim_start()
                .strip_prefix('(')
                .and_then(|rest| rest.split_once(')'))
                .ok_or_else(|| invalid("invalid SET command"))?;
            let value = value
                .trim_start()
                .strip_prefix(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| invalid("invalid SET command"))?;
            let key = Key::parse(key).map_err(|e| invalid(&format!("invalid SET command ({e})")))?;
            Ok(Self::Set {
                system,
                key,
                value: value.to_string(),
            })
        } else if upper.starts_with("MERGE") {
            let peer = call(op, &op[..5])
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| invalid("invalid MERGE command"))?;
            Ok(Self::Merge {
                system,
                peer: peer.to_lowercase(),
            })
        } else {
            Err(ParseError(format!("unknown operation: {op}")))
        }
    }
}

/// Parse and execute one script line, returning what the harness prints.
///
/// Failures are reported in the returned line; nothing here aborts a run.
pub fn execute_line(set: &ReplicaSet, line: &str) -> String {
    let cmd = strip_timestamp(line);
    let command = match Command::parse(cmd) {
        Ok(c) => c,
        Err(e) => return e.to_string(),
    };

    let outcome = match &command {
        Command::Get { system, key } => set.get(system, key).map(|grade| {
            format!("{cmd} => {}", grade.as_deref().unwrap_or("None"))
        }),
        Command::Set { system, key, value } => {
            set.set(system, key, value).map(|()| format!("Executed: {cmd}"))
        }
        Command::Merge { system, peer } => set.merge(system, peer).map(|report| {
            tracing::info!("{system}: {report}");
            format!("Executed: {cmd}")
        }),
    };
    outcome.unwrap_or_else(|e| format!("Error executing command '{cmd}': {e}"))
}

/// Remove every replica's persisted log and merge history.
fn clear_logs(config: &Config) -> Result {
    for name in config.names() {
        for path in [log_path(&config.data_dir, &name), history_path(&config.data_dir, &name)] {
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!("removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(format!("cannot remove {}: {e}", path.display()).into()),
            }
        }
    }
    Ok(())
}

/// `gradesync run <script>`: execute a harness script line by line.
pub fn run(config: &Config, script: &str, fresh: bool) -> Result {
    let contents =
        fs::read_to_string(script).map_err(|e| format!("cannot read {script}: {e}"))?;
    if fresh {
        clear_logs(config)?;
    }
    let set = config.open()?;

    for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
        println!("{}", execute_line(&set, line));
    }
    Ok(())
}

/// `gradesync get <system> <student> <course>`
pub fn get(config: &Config, system: &str, student: &str, course: &str) -> Result {
    let set = config.open()?;
    let key = Key::new(student, course);
    match set.get(system, &key)? {
        Some(grade) => println!("{grade}"),
        None => println!("None"),
    }
    Ok(())
}

/// `gradesync set <system> <student> <course> <grade>`
pub fn set(config: &Config, system: &str, student: &str, course: &str, grade: &str) -> Result {
    let set = config.open()?;
    set.set(system, &Key::new(student, course), grade)?;
    println!("Executed: {}.SET(({student},{course}), {grade})", system.to_uppercase());
    Ok(())
}

/// `gradesync merge <system> <other>`
pub fn merge(config: &Config, system: &str, other: &str) -> Result {
    let set = config.open()?;
    let report = set.merge(system, other)?;
    println!("{}: {report}", system.to_lowercase());
    Ok(())
}

/// `gradesync log <system>`: the replica's operation log as a table, or as
/// JSON with `--json`.
pub fn log(config: &Config, system: &str, last: Option<usize>, json: bool) -> Result {
    let set = config.open()?;
    set.inspect(system, |replica| -> Result {
        let ops = replica.log().operations();
        let skip = last.map_or(0, |n| ops.len().saturating_sub(n));

        if json {
            println!("{}", serde_json::to_string_pretty(&ops[skip..])?);
            return Ok(());
        }

        println!("Replica: {} ({}, {} operations)", replica.name(), replica.backend(), ops.len());
        println!();
        if ops.is_empty() {
            println!("  (empty log)");
            return Ok(());
        }

        println!(
            "  {:<26} {:<4} {:<20} {:<6} {}",
            "Timestamp", "Op", "Key", "Value", "Origin"
        );
        println!("  {}", "-".repeat(78));
        for op in &ops[skip..] {
            let key = op.key.as_ref().map(Key::to_string).unwrap_or_default();
            let value = op.value.as_deref().unwrap_or("-");
            let origin = op
                .origin
                .as_ref()
                .map(|o| format!("{} @ {}", o.replica, o.timestamp))
                .unwrap_or_default();
            println!(
                "  {:<26} {:<4} {:<20} {:<6} {}",
                op.timestamp.to_string(),
                op.kind.to_string(),
                key,
                value,
                origin
            );
        }
        Ok(())
    })?
}

/// `gradesync status`: backend, log size, and merge bookmarks per replica.
pub fn status(config: &Config) -> Result {
    let set = config.open()?;
    println!("Data directory: {}", config.data_dir.display());
    println!();

    println!("  {:<14} {:<8} {:>10}   {}", "Replica", "Backend", "Ops", "Last merge");
    println!("  {}", "-".repeat(70));
    for name in set.names() {
        set.inspect(name, |replica| {
            let history: Vec<String> = replica
                .log()
                .merge_history()
                .iter()
                .map(|(peer, at)| match at {
                    Some(ts) => format!("{peer}={ts}"),
                    None => format!("{peer}=never"),
                })
                .collect();
            let history = if history.is_empty() {
                "-".to_string()
            } else {
                history.join(", ")
            };
            println!(
                "  {:<14} {:<8} {:>10}   {}",
                replica.name(),
                replica.backend(),
                replica.log().len(),
                history
            );
        })?;
    }
    println!();
    Ok(())
}
