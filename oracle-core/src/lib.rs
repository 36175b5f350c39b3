use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub mod asm;
pub mod banks;
pub mod logging;
pub mod logic;
pub mod manifest;
pub mod patch;
pub mod rom;
pub mod tables;

pub use asm::{AsmError, Assembler, Sm83Assembler};
pub use banks::BankAllocator;
pub use logic::{build_registry, flatten, merge, Node, NodeTable, NodeType, Parent, Registry};
pub use manifest::{load_node_tables, parse_node_table, PatchManifest, PatchOp, Payload};
pub use patch::{PatchEngine, PatchKind, PatchRecord};
pub use rom::{Address, Rom};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomiserSettings {
    pub rom_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(default)]
    pub logic_path: Option<PathBuf>,
    #[serde(default)]
    pub patch_path: Option<PathBuf>,
    #[serde(default)]
    pub registry_output: Option<PathBuf>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Error)]
pub enum RandomiserError {
    #[error("duplicate logic key: {0}")]
    DuplicateKey(String),
    #[error("node '{node}' names unknown parent '{parent}'")]
    UnknownParent { node: String, parent: String },
    #[error("root node '{0}' has parents")]
    RootWithParents(String),
    #[error("node '{0}' still has an inline parent after flattening")]
    InlineParent(String),
    #[error("bank {bank:02x} overflow: block would end at {attempted_end:#06x}, capacity {capacity:#06x}")]
    CapacityExceeded {
        bank: u8,
        attempted_end: u32,
        capacity: u32,
    },
    #[error("bank {0:02x} has no free space")]
    BankUnavailable(u8),
    #[error("bank {0:02x} is sealed by a tail block")]
    BankSealed(u8),
    #[error(
        "verification failed for '{label}' at {bank:02x}:{address:04x}: expected {}, found {}",
        hex::encode(.expected),
        hex::encode(.actual)
    )]
    VerificationMismatch {
        label: String,
        bank: u8,
        address: u16,
        expected: Vec<u8>,
        actual: Vec<u8>,
    },
    #[error("'{label}' lists overlapping locations {first} and {second}")]
    OverlappingLocations {
        label: String,
        first: Address,
        second: Address,
    },
    #[error("{len} bytes at {address} fall outside the bank or image")]
    AddressOutOfRange { address: Address, len: usize },
    #[error("assembler error: {0}")]
    Asm(#[from] AsmError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("directory walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad hex payload: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RandomiserError>;

/// What a successful build produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub nodes: usize,
    pub records: Vec<PatchRecord>,
    pub checksum: Option<u16>,
}

/// Load the base image and pick the starting cursors: the built-in table,
/// then any manifest overrides on top.
fn prepare_engine(
    rom: Rom,
    manifest: &PatchManifest,
) -> Result<PatchEngine<Sm83Assembler>> {
    let mut end_of_bank = tables::AGES_END_OF_BANK.to_vec();
    end_of_bank.extend(manifest.end_of_bank()?);
    let banks = BankAllocator::new(end_of_bank)?;
    Ok(PatchEngine::new(rom, banks, Sm83Assembler::new()))
}

fn write_output(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, bytes)
}

/// Write every output or none. Files already written are removed again if
/// a later one fails.
fn commit_outputs(outputs: &[(PathBuf, Vec<u8>)]) -> Result<()> {
    for (i, (path, bytes)) in outputs.iter().enumerate() {
        if let Err(err) = write_output(path, bytes) {
            for (done, _) in &outputs[..i] {
                let _ = fs::remove_file(done);
            }
            return Err(err.into());
        }
    }
    Ok(())
}

fn patch_log(records: &[PatchRecord]) -> String {
    let mut log = String::new();
    for record in records {
        let _ = writeln!(log, "{record}");
    }
    log
}

/// Build the logic registry, patch the image, and write the result.
/// Nothing is written unless every step succeeds.
pub fn run(settings: RandomiserSettings) -> Result<BuildReport> {
    if !settings.rom_path.exists() {
        return Err(RandomiserError::Config(format!(
            "ROM does not exist: {}",
            settings.rom_path.display()
        )));
    }

    let registry = match &settings.logic_path {
        Some(dir) => build_registry(load_node_tables(dir)?)?,
        None => Registry::default(),
    };

    let rom = Rom::load(&settings.rom_path)?;
    if !rom.header_checksum_valid() {
        warn!(path = %settings.rom_path.display(), "header checksum does not match; continuing");
    }

    let manifest = match &settings.patch_path {
        Some(path) => PatchManifest::load(path)?,
        None => PatchManifest::default(),
    };
    let mut engine = prepare_engine(rom, &manifest)?;
    manifest.apply(&mut engine)?;

    let (mut rom, records) = engine.finish();
    let checksum = rom.fix_global_checksum();

    // Everything that can fail short of disk I/O happens before the first write.
    let mut outputs = vec![(settings.output_path.clone(), rom.into_bytes())];
    if let Some(path) = &settings.registry_output {
        outputs.push((path.clone(), serde_json::to_vec_pretty(&registry)?));
    }
    if settings.debug {
        let log_path = settings.output_path.with_extension("patches.txt");
        outputs.push((log_path, patch_log(&records).into_bytes()));
    }
    commit_outputs(&outputs)?;
    info!(
        path = %settings.output_path.display(),
        patches = records.len(),
        "patched image written"
    );

    Ok(BuildReport {
        nodes: registry.len(),
        records,
        checksum,
    })
}
