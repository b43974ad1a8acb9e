//! Save/restore backends
//!
//! The chain model talks to the kernel through two primitives: `save` (dump
//! every table as restore-format text) and `restore` (apply a payload
//! without flushing untouched chains). The real backend shells out to the
//! `iptables-save`/`iptables-restore` pair; the fake backend keeps tables in
//! memory and is what every test drives.

use std::collections::HashMap;
use std::io::Write;
use std::process::{Command as Process, Stdio};

use parking_lot::Mutex;

use super::rules::Rule;
use crate::error::NetfilterError;

/// Address family a backend operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// IPv4 (`iptables`)
    Ipv4,
    /// IPv6 (`ip6tables`)
    Ipv6,
}

/// Save/restore primitive pair.
pub trait Backend: Send + Sync {
    /// The address family this backend manages.
    fn proto(&self) -> Protocol;

    /// Dump all tables in restore format.
    fn save(&self) -> Result<Vec<u8>, NetfilterError>;

    /// Apply a restore payload without flushing untouched chains.
    fn restore(&self, payload: &[u8]) -> Result<(), NetfilterError>;
}

/// Backend that invokes the host's `iptables-save` / `iptables-restore`
/// (or the `ip6tables` pair).
#[derive(Debug)]
pub struct ExecBackend {
    proto: Protocol,
    save_program: &'static str,
    restore_program: &'static str,
}

impl ExecBackend {
    /// Backend for the given family.
    #[must_use]
    pub fn new(proto: Protocol) -> Self {
        match proto {
            Protocol::Ipv4 => Self {
                proto,
                save_program: "iptables-save",
                restore_program: "iptables-restore",
            },
            Protocol::Ipv6 => Self {
                proto,
                save_program: "ip6tables-save",
                restore_program: "ip6tables-restore",
            },
        }
    }
}

impl Backend for ExecBackend {
    fn proto(&self) -> Protocol {
        self.proto
    }

    fn save(&self) -> Result<Vec<u8>, NetfilterError> {
        let output = Process::new(self.save_program).output()?;
        if !output.status.success() {
            return Err(NetfilterError::command_failed(
                self.save_program,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        Ok(output.stdout)
    }

    fn restore(&self, payload: &[u8]) -> Result<(), NetfilterError> {
        let mut child = Process::new(self.restore_program)
            .arg("--noflush")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(payload)?;
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(NetfilterError::command_failed(
                self.restore_program,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        Ok(())
    }
}

/// In-memory backend that interprets restore payloads against a table map.
///
/// Used by tests and dry runs; behaves like `iptables-restore --noflush` on
/// a kernel seeded with `set_initial_rules`.
#[derive(Debug)]
pub struct FakeBackend {
    proto: Protocol,
    tables: Mutex<HashMap<String, HashMap<String, Vec<Rule>>>>,
    applied_lines: Mutex<Vec<String>>,
}

impl FakeBackend {
    /// Fake backend for the given family.
    #[must_use]
    pub fn new(proto: Protocol) -> Self {
        Self {
            proto,
            tables: Mutex::new(HashMap::new()),
            applied_lines: Mutex::new(Vec::new()),
        }
    }

    /// Seed a chain's live rules.
    pub fn set_initial_rules<I>(&self, table: &str, chain: &str, rules: I)
    where
        I: IntoIterator<Item = Rule>,
    {
        let mut tables = self.tables.lock();
        tables
            .entry(table.to_string())
            .or_default()
            .insert(chain.to_string(), rules.into_iter().collect());
    }

    /// Current rules of a chain, or `None` when the chain does not exist.
    #[must_use]
    pub fn rules(&self, table: &str, chain: &str) -> Option<Vec<Rule>> {
        self.tables.lock().get(table)?.get(chain).cloned()
    }

    /// Whether the chain exists.
    #[must_use]
    pub fn chain_exists(&self, table: &str, chain: &str) -> bool {
        self.tables
            .lock()
            .get(table)
            .is_some_and(|chains| chains.contains_key(chain))
    }

    /// Every payload line applied so far, in order.
    #[must_use]
    pub fn applied(&self) -> Vec<String> {
        self.applied_lines.lock().clone()
    }
}

impl Backend for FakeBackend {
    fn proto(&self) -> Protocol {
        self.proto
    }

    fn save(&self) -> Result<Vec<u8>, NetfilterError> {
        let tables = self.tables.lock();
        let mut out = String::new();
        for (table, chains) in tables.iter() {
            out.push_str(&format!("*{table}\n"));
            for chain in chains.keys() {
                out.push_str(&format!(":{chain} - [0:0]\n"));
            }
            for (chain, rules) in chains.iter() {
                for rule in rules {
                    out.push_str(&format!("-A {chain} {rule}\n"));
                }
            }
            out.push_str("COMMIT\n");
        }
        Ok(out.into_bytes())
    }

    fn restore(&self, payload: &[u8]) -> Result<(), NetfilterError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| NetfilterError::parse(format!("restore payload not UTF-8: {e}")))?;
        let mut tables = self.tables.lock();
        let mut applied = self.applied_lines.lock();

        let mut current: Option<String> = None;
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            applied.push(line.to_string());

            if let Some(table) = line.strip_prefix('*') {
                current = Some(table.to_string());
                tables.entry(table.to_string()).or_default();
                continue;
            }
            if line == "COMMIT" {
                current = None;
                continue;
            }
            let table = current
                .as_ref()
                .ok_or_else(|| NetfilterError::parse(format!("line outside table: {line:?}")))?;
            let chains = tables.get_mut(table).expect("table entry created above");

            if let Some(decl) = line.strip_prefix(':') {
                let chain = decl
                    .split_whitespace()
                    .next()
                    .ok_or_else(|| NetfilterError::parse("empty chain declaration"))?;
                chains.entry(chain.to_string()).or_default();
                continue;
            }

            let mut parts = line.split_whitespace();
            let op = parts
                .next()
                .ok_or_else(|| NetfilterError::parse("empty command"))?;
            let chain = parts
                .next()
                .ok_or_else(|| NetfilterError::parse(format!("command without chain: {line:?}")))?
                .to_string();

            match op {
                "-A" => {
                    let rule = Rule::new(parts.map(|t| t.as_bytes().to_vec()));
                    chains.entry(chain).or_default().push(rule);
                }
                "-D" => {
                    let rule = Rule::new(parts.map(|t| t.as_bytes().to_vec()));
                    let rules = chains.get_mut(&chain).ok_or_else(|| {
                        NetfilterError::NotFound(format!("chain {table}/{chain}"))
                    })?;
                    let pos = rules.iter().position(|r| *r == rule).ok_or_else(|| {
                        NetfilterError::NotFound(format!("rule in {table}/{chain}"))
                    })?;
                    rules.remove(pos);
                }
                "-I" => {
                    let position: usize = parts
                        .next()
                        .and_then(|p| p.parse().ok())
                        .ok_or_else(|| NetfilterError::parse("insert without position"))?;
                    let rule = Rule::new(parts.map(|t| t.as_bytes().to_vec()));
                    let rules = chains.entry(chain).or_default();
                    let idx = (position - 1).min(rules.len());
                    rules.insert(idx, rule);
                }
                "-F" => {
                    if let Some(rules) = chains.get_mut(&chain) {
                        rules.clear();
                    }
                }
                "-X" => {
                    chains.remove(&chain);
                }
                other => {
                    return Err(NetfilterError::parse(format!(
                        "unknown restore command {other:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}
