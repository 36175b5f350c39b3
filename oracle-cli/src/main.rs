use clap::Parser;
use std::path::PathBuf;

use oracle_core::logging::{self, Profile};
use oracle_core::{run, Assembler, RandomiserSettings, Sm83Assembler};

#[derive(Debug, Parser)]
#[command(name = "oracle-rando", version, about = "Oracle of Ages logic builder and ROM patcher")]
struct Args {
    /// Base image to patch.
    #[arg(long, required_unless_present = "assemble")]
    rom: Option<PathBuf>,

    /// Where to write the patched image.
    #[arg(long, required_unless_present = "assemble")]
    output: Option<PathBuf>,

    /// Directory of JSON node tables.
    #[arg(long)]
    logic: Option<PathBuf>,

    /// JSON patch manifest.
    #[arg(long)]
    patches: Option<PathBuf>,

    /// Write the flattened logic registry here as JSON.
    #[arg(long)]
    registry_out: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Debug-only: assemble a line of source, print the bytes in hex and
    /// exit without touching any image.
    #[arg(long, value_name = "ASM", hide = true)]
    assemble: Option<String>,
}

fn main() {
    let args = Args::parse();
    logging::init(if args.debug {
        Profile::Debug
    } else {
        Profile::Normal
    });

    if let Some(source) = args.assemble.as_ref() {
        match Sm83Assembler::new().compile(source) {
            Ok(bytes) => println!("{}", spaced_hex(&bytes)),
            Err(e) => {
                eprintln!("Failed to assemble {:?}: {}", source, e);
                std::process::exit(1);
            }
        }
        return;
    }

    let (Some(rom_path), Some(output_path)) = (args.rom, args.output) else {
        eprintln!("Error: --rom and --output are required");
        std::process::exit(2);
    };

    let settings = RandomiserSettings {
        rom_path,
        output_path,
        logic_path: args.logic,
        patch_path: args.patches,
        registry_output: args.registry_out,
        debug: args.debug,
    };

    if let Err(err) = run(settings) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn spaced_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_only_needs_no_paths() {
        let args = Args::try_parse_from(["oracle-rando", "--assemble", "call 3ef8"]).unwrap();
        assert!(args.rom.is_none());
        assert_eq!(args.assemble.as_deref(), Some("call 3ef8"));
    }

    #[test]
    fn build_requires_rom_and_output() {
        assert!(Args::try_parse_from(["oracle-rando", "--rom", "in.gbc"]).is_err());
        let args = Args::try_parse_from([
            "oracle-rando",
            "--rom",
            "in.gbc",
            "--output",
            "out.gbc",
            "--patches",
            "patches.json",
            "--debug",
        ])
        .unwrap();
        assert!(args.debug);
        assert_eq!(args.patches, Some(PathBuf::from("patches.json")));
    }

    #[test]
    fn hex_output_is_spaced() {
        assert_eq!(spaced_hex(&[0xcd, 0xf8, 0x3e]), "cd f8 3e");
    }
}
