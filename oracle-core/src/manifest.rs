//! On-disk formats: node tables and patch manifests.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::{Error as _, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::asm::Assembler;
use crate::logic::{Node, NodeTable};
use crate::patch::PatchEngine;
use crate::rom::Address;
use crate::{RandomiserError, Result};

/// A JSON integer, or a string holding hex (`"0x7a31"`, `"$7a31"`, `"7a31"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Number {
    Int(u32),
    Text(String),
}

impl Number {
    fn value(&self) -> std::result::Result<u32, String> {
        match self {
            Number::Int(n) => Ok(*n),
            Number::Text(s) => parse_hex(s).ok_or_else(|| format!("invalid hex number '{}'", s)),
        }
    }
}

fn parse_hex(s: &str) -> Option<u32> {
    let t = s.trim();
    let digits = t
        .strip_prefix("0x")
        .or_else(|| t.strip_prefix("0X"))
        .or_else(|| t.strip_prefix('$'))
        .unwrap_or(t);
    u32::from_str_radix(digits, 16).ok()
}

fn de_u8<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u8, D::Error> {
    let n = Number::deserialize(d)?.value().map_err(D::Error::custom)?;
    u8::try_from(n).map_err(|_| D::Error::custom(format!("{:#x} does not fit a bank number", n)))
}

fn de_u16<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u16, D::Error> {
    let n = Number::deserialize(d)?.value().map_err(D::Error::custom)?;
    u16::try_from(n).map_err(|_| D::Error::custom(format!("{:#x} does not fit an address", n)))
}

/// Bytes given either literally or as assembler source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Hex(String),
    Asm(String),
}

impl Payload {
    pub fn bytes<A: Assembler>(&self, engine: &PatchEngine<A>) -> Result<Vec<u8>> {
        match self {
            Payload::Hex(text) => {
                let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
                Ok(hex::decode(compact)?)
            }
            Payload::Asm(source) => engine.compile(source),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Location(
    #[serde(deserialize_with = "de_u8")] pub u8,
    #[serde(deserialize_with = "de_u16")] pub u16,
);

impl From<Location> for Address {
    fn from(loc: Location) -> Self {
        Address::new(loc.0, loc.1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    Append {
        #[serde(deserialize_with = "de_u8")]
        bank: u8,
        label: String,
        data: Payload,
    },
    Routine {
        #[serde(deserialize_with = "de_u8")]
        bank: u8,
        name: String,
        asm: String,
    },
    Replace {
        #[serde(deserialize_with = "de_u8")]
        bank: u8,
        #[serde(deserialize_with = "de_u16")]
        addr: u16,
        label: String,
        old: Payload,
        new: Payload,
    },
    ReplaceMultiple {
        locations: Vec<Location>,
        label: String,
        old: Payload,
        new: Payload,
    },
    ReplaceAsm {
        #[serde(deserialize_with = "de_u8")]
        bank: u8,
        #[serde(deserialize_with = "de_u16")]
        addr: u16,
        old: String,
        new: String,
    },
    Tail {
        #[serde(deserialize_with = "de_u8")]
        bank: u8,
        label: String,
    },
    FillTail {
        #[serde(deserialize_with = "de_u8")]
        bank: u8,
        data: Payload,
    },
}

/// A declarative patch set, applied in order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PatchManifest {
    #[serde(default)]
    end_of_bank: BTreeMap<String, Number>,
    #[serde(default)]
    pub ops: Vec<PatchOp>,
}

impl PatchManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
            .map_err(|e| RandomiserError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Cursor overrides as `(bank, end_of_used_content)` pairs.
    pub fn end_of_bank(&self) -> Result<Vec<(u8, u16)>> {
        self.end_of_bank
            .iter()
            .map(|(bank, cursor)| {
                let bank = parse_hex(bank)
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| RandomiserError::Config(format!("invalid bank '{}'", bank)))?;
                let cursor = cursor
                    .value()
                    .ok()
                    .and_then(|c| u16::try_from(c).ok())
                    .ok_or_else(|| {
                        RandomiserError::Config(format!("invalid cursor for bank {:02x}", bank))
                    })?;
                Ok((bank, cursor))
            })
            .collect()
    }

    /// Replay every operation against `engine`. Stops at the first failure.
    pub fn apply<A: Assembler>(&self, engine: &mut PatchEngine<A>) -> Result<()> {
        for op in &self.ops {
            apply_op(op, engine)?;
        }
        info!(ops = self.ops.len(), records = engine.records().len(), "patch manifest applied");
        Ok(())
    }
}

fn apply_op<A: Assembler>(op: &PatchOp, engine: &mut PatchEngine<A>) -> Result<()> {
    match op {
        PatchOp::Append { bank, label, data } => {
            let bytes = data.bytes(engine)?;
            engine.append(*bank, label, &bytes)?;
        }
        PatchOp::Routine { bank, name, asm } => {
            engine.append_asm(*bank, name, asm)?;
        }
        PatchOp::Replace {
            bank,
            addr,
            label,
            old,
            new,
        } => {
            let old = old.bytes(engine)?;
            let new = new.bytes(engine)?;
            engine.replace(Address::new(*bank, *addr), label, &old, &new)?;
        }
        PatchOp::ReplaceMultiple {
            locations,
            label,
            old,
            new,
        } => {
            let old = old.bytes(engine)?;
            let new = new.bytes(engine)?;
            let addrs: Vec<Address> = locations.iter().copied().map(Address::from).collect();
            engine.replace_multiple(&addrs, label, &old, &new)?;
        }
        PatchOp::ReplaceAsm {
            bank,
            addr,
            old,
            new,
        } => {
            engine.replace_asm(Address::new(*bank, *addr), old, new)?;
        }
        PatchOp::Tail { bank, label } => {
            engine.reserve_tail(*bank, label)?;
        }
        PatchOp::FillTail { bank, data } => {
            let bytes = data.bytes(engine)?;
            engine.fill_tail(*bank, &bytes)?;
        }
    }
    Ok(())
}

/// A node table in file order, repeated names included.
struct TableEntries(Vec<(String, Node)>);

impl<'de> Deserialize<'de> for TableEntries {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = TableEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of node names to nodes")
            }

            fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> std::result::Result<TableEntries, M::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, Node>()? {
                    entries.push(entry);
                }
                Ok(TableEntries(entries))
            }
        }

        d.deserialize_map(EntriesVisitor)
    }
}

/// Parse one node table. A name given twice is a `DuplicateKey`, not a
/// silent overwrite.
pub fn parse_node_table(text: &str) -> Result<NodeTable> {
    let TableEntries(entries) = serde_json::from_str(text)?;
    let mut table = NodeTable::new();
    for (name, node) in entries {
        if table.contains_key(&name) {
            return Err(RandomiserError::DuplicateKey(name));
        }
        table.insert(name, node);
    }
    Ok(table)
}

/// Load every `*.json` node table under `dir`, in path order.
pub fn load_node_tables(dir: &Path) -> Result<Vec<NodeTable>> {
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().map_or(false, |e| e == "json") {
            paths.push(path.to_path_buf());
        }
    }

    let mut tables = Vec::with_capacity(paths.len());
    for path in paths {
        let text = fs::read_to_string(&path)?;
        let table = parse_node_table(&text).map_err(|e| match e {
            RandomiserError::Json(e) => {
                RandomiserError::Config(format!("{}: {}", path.display(), e))
            }
            other => other,
        })?;
        debug!(path = %path.display(), nodes = table.len(), "loaded node table");
        tables.push(table);
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Sm83Assembler;
    use crate::banks::BankAllocator;
    use crate::rom::{Rom, BANK_SIZE};

    const MANIFEST: &str = r#"{
        "end_of_bank": { "0x06": "0x7a31", "1": 32707 },
        "ops": [
            { "op": "routine", "bank": 0, "name": "filterMusic", "asm": "ld h,a; ld a,(ff00+b7); ret" },
            { "op": "replace_asm", "bank": 0, "addr": "0x0c9a", "old": "ld h,a; ld a,(ff00+b7)", "new": "call filterMusic" },
            { "op": "append", "bank": "0x06", "label": "remove yoll tree", "data": { "hex": "f5 f0 8f c9" } },
            { "op": "replace", "bank": 6, "addr": "0x47aa", "label": "call remove yoll tree",
              "old": { "hex": "2126c6" }, "new": { "asm": "call 7a31" } },
            { "op": "replace_multiple", "locations": [[2, "0x6133"], [2, "0x618b"]], "label": "tree warp jump",
              "old": { "hex": "c2ba4f" }, "new": { "asm": "call nz,filterMusic" } },
            { "op": "tail", "bank": "0x38", "label": "owl text" },
            { "op": "fill_tail", "bank": "0x38", "data": { "hex": "0102" } }
        ]
    }"#;

    fn engine(end_of_bank: &[(u8, u16)]) -> PatchEngine<Sm83Assembler> {
        let mut data = vec![0u8; BANK_SIZE * 0x40];
        data[0x0c9a..0x0c9d].copy_from_slice(&[0x67, 0xf0, 0xb7]);
        data[0x187aa..0x187ad].copy_from_slice(&[0x21, 0x26, 0xc6]);
        data[0xa133..0xa136].copy_from_slice(&[0xc2, 0xba, 0x4f]);
        data[0xa18b..0xa18e].copy_from_slice(&[0xc2, 0xba, 0x4f]);
        let mut table = vec![(0x00, 0x3ef8), (0x38, 0x6b00)];
        table.extend_from_slice(end_of_bank);
        let banks = BankAllocator::new(table).unwrap();
        PatchEngine::new(Rom::new(data), banks, Sm83Assembler::new())
    }

    #[test]
    fn parses_numbers_as_int_or_hex() {
        let manifest = PatchManifest::from_json(MANIFEST).unwrap();
        assert_eq!(manifest.end_of_bank().unwrap(), vec![(0x06, 0x7a31), (0x01, 0x7fc3)]);
        assert_eq!(manifest.ops.len(), 7);
        assert_eq!(
            manifest.ops[1],
            PatchOp::ReplaceAsm {
                bank: 0,
                addr: 0x0c9a,
                old: "ld h,a; ld a,(ff00+b7)".to_string(),
                new: "call filterMusic".to_string(),
            }
        );
    }

    #[test]
    fn applies_ops_in_order() {
        let manifest = PatchManifest::from_json(MANIFEST).unwrap();
        let mut e = engine(&manifest.end_of_bank().unwrap());
        manifest.apply(&mut e).unwrap();
        let rom = e.rom().as_bytes();
        assert_eq!(&rom[0x0c9a..0x0c9d], &[0xcd, 0xf8, 0x3e]);
        assert_eq!(&rom[0x1ba31..0x1ba35], &[0xf5, 0xf0, 0x8f, 0xc9]);
        assert_eq!(&rom[0x187aa..0x187ad], &[0xcd, 0x31, 0x7a]);
        assert_eq!(&rom[0xa133..0xa136], &[0xc4, 0xf8, 0x3e]);
        assert_eq!(&rom[0xe2b00..0xe2b02], &[0x01, 0x02]);
        assert!(e.banks().is_sealed(0x38));
    }

    #[test]
    fn stops_at_first_mismatch() {
        let manifest = PatchManifest::from_json(
            r#"{ "ops": [
                { "op": "replace", "bank": 0, "addr": "0x0c9a", "label": "wrong", "old": { "hex": "00" }, "new": { "hex": "01" } },
                { "op": "append", "bank": 0, "label": "never", "data": { "hex": "ff" } }
            ] }"#,
        )
        .unwrap();
        let mut e = engine(&[]);
        let err = manifest.apply(&mut e).unwrap_err();
        assert!(matches!(err, RandomiserError::VerificationMismatch { ref label, .. } if label == "wrong"));
        assert!(e.records().is_empty());
    }

    #[test]
    fn rejects_oversized_numbers() {
        let err = PatchManifest::from_json(
            r#"{ "ops": [ { "op": "tail", "bank": "0x100", "label": "x" } ] }"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn node_table_keeps_authored_entries() {
        let table = parse_node_table(
            r#"{ "open": { "type": "root" }, "sword": { "type": "and", "parents": ["open"] } }"#,
        )
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table["sword"], Node::and(["open"]));
    }

    #[test]
    fn node_table_rejects_repeated_name() {
        let err = parse_node_table(
            r#"{ "sword": { "type": "root" }, "sword": { "type": "and", "parents": ["x"] } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, RandomiserError::DuplicateKey(ref k) if k == "sword"));
    }

    #[test]
    fn loading_a_directory_reports_repeated_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.json"), r#"{ "open": { "type": "root" } }"#).unwrap();
        fs::write(
            dir.path().join("b.json"),
            r#"{ "sword": { "type": "root" }, "sword": { "type": "or", "parents": ["open"] } }"#,
        )
        .unwrap();
        let err = load_node_tables(dir.path()).unwrap_err();
        assert!(matches!(err, RandomiserError::DuplicateKey(ref k) if k == "sword"));
    }

    #[test]
    fn malformed_table_names_its_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.json"), "{ \"open\": ").unwrap();
        match load_node_tables(dir.path()).unwrap_err() {
            RandomiserError::Config(msg) => assert!(msg.contains("bad.json")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
