use std::collections::HashMap;

use thiserror::Error;

use crate::rom::Address;

/// Errors that can occur while assembling patch source.
#[derive(Debug, Error)]
pub enum AsmError {
    #[error("unknown mnemonic '{mnemonic}' in '{instruction}'")]
    UnknownMnemonic {
        instruction: String,
        mnemonic: String,
    },

    #[error("wrong operand count for {mnemonic} in '{instruction}': expected {expected}, got {got}")]
    WrongArgCount {
        instruction: String,
        mnemonic: String,
        expected: usize,
        got: usize,
    },

    #[error("unsupported operands for {mnemonic} in '{instruction}'")]
    BadOperands {
        instruction: String,
        mnemonic: String,
    },

    #[error("value '{token}' in '{instruction}' is out of range for {kind}")]
    ValueOutOfRange {
        instruction: String,
        token: String,
        kind: &'static str,
    },

    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),

    #[error("symbol '{name}' is already defined at {existing}")]
    Redefined { name: String, existing: Address },
}

/// What the patch engine needs from an assembler: turn source text into
/// bytes, and resolve named routines to addresses.
pub trait Assembler {
    fn compile(&self, source: &str) -> Result<Vec<u8>, AsmError>;

    fn get_def(&self, name: &str) -> Result<Address, AsmError>;

    /// Make `name` resolvable by later `compile` and `get_def` calls.
    fn define(&mut self, name: &str, addr: Address) -> Result<(), AsmError>;
}

/// Assembler for the Game Boy CPU (SM83).
///
/// Source is a list of instructions separated by `;` or newlines, in the
/// usual lowercase syntax (`ld a,(ff00+b7)`, `call nz,label`, `db 01,02`).
/// Bare numbers are hex; `$` and `0x` prefixes are accepted too. Operands
/// are looked up as symbols first, then read as numbers. Segments
/// starting with `#` or `//` are ignored. Symbols are case-insensitive.
#[derive(Clone, Debug, Default)]
pub struct Sm83Assembler {
    defs: HashMap<String, Address>,
}

impl Sm83Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defs<I, S>(defs: I) -> Result<Self, AsmError>
    where
        I: IntoIterator<Item = (S, Address)>,
        S: AsRef<str>,
    {
        let mut asm = Self::new();
        for (name, addr) in defs {
            asm.define(name.as_ref(), addr)?;
        }
        Ok(asm)
    }

    fn encode(&self, instruction: &str, out: &mut Vec<u8>) -> Result<(), AsmError> {
        let (mnemonic, rest) = match instruction.split_once(char::is_whitespace) {
            Some((m, r)) => (m.to_ascii_lowercase(), r.trim()),
            None => (instruction.to_ascii_lowercase(), ""),
        };
        let args: Vec<String> = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split(',')
                .map(|a| a.split_whitespace().collect::<String>().to_ascii_lowercase())
                .collect()
        };
        let line = Line {
            asm: self,
            instruction,
            mnemonic: &mnemonic,
            args: &args,
        };

        if let Some(op) = implied_opcode(&mnemonic) {
            line.arg_count(0)?;
            out.extend_from_slice(op);
            return Ok(());
        }

        match mnemonic.as_str() {
            "ret" => match args.len() {
                0 => out.push(0xc9),
                1 => out.push(0xc0 | line.cond(&args[0])? << 3),
                _ => return Err(line.wrong_count(1)),
            },

            "call" | "jp" => {
                let (plain, conditional) = if mnemonic == "call" {
                    (0xcd, 0xc4)
                } else {
                    (0xc3, 0xc2)
                };
                match args.len() {
                    1 if mnemonic == "jp" && (args[0] == "hl" || args[0] == "(hl)") => {
                        out.push(0xe9)
                    }
                    1 => {
                        out.push(plain);
                        out.extend_from_slice(&line.word(&args[0])?.to_le_bytes());
                    }
                    2 => {
                        out.push(conditional | line.cond(&args[0])? << 3);
                        out.extend_from_slice(&line.word(&args[1])?.to_le_bytes());
                    }
                    _ => return Err(line.wrong_count(1)),
                }
            }

            "jr" => match args.len() {
                1 => out.extend_from_slice(&[0x18, line.byte(&args[0])?]),
                2 => out.extend_from_slice(&[0x20 | line.cond(&args[0])? << 3, line.byte(&args[1])?]),
                _ => return Err(line.wrong_count(1)),
            },

            "rst" => {
                line.arg_count(1)?;
                let n = line.byte(&args[0])?;
                if n % 8 != 0 || n > 0x38 {
                    return Err(line.out_of_range(&args[0], "rst vector"));
                }
                out.push(0xc7 | n);
            }

            "push" | "pop" => {
                line.arg_count(1)?;
                let qq = match args[0].as_str() {
                    "bc" => 0,
                    "de" => 1,
                    "hl" => 2,
                    "af" => 3,
                    _ => return Err(line.bad_operands()),
                };
                let base = if mnemonic == "push" { 0xc5 } else { 0xc1 };
                out.push(base | qq << 4);
            }

            "inc" | "dec" => {
                line.arg_count(1)?;
                let dec = mnemonic == "dec";
                if let Some(r) = reg8(&args[0]) {
                    out.push((if dec { 0x05 } else { 0x04 }) | r << 3);
                } else if let Some(rr) = reg16(&args[0]) {
                    out.push((if dec { 0x0b } else { 0x03 }) | rr << 4);
                } else {
                    return Err(line.bad_operands());
                }
            }

            "add" if args.len() == 2 && args[0] == "hl" => {
                let rr = reg16(&args[1]).ok_or_else(|| line.bad_operands())?;
                out.push(0x09 | rr << 4);
            }

            "add" if args.len() == 2 && args[0] == "sp" => {
                out.extend_from_slice(&[0xe8, line.byte(&args[1])?]);
            }

            "add" | "adc" | "sub" | "sbc" | "and" | "xor" | "or" | "cp" => {
                let operand = match args.len() {
                    1 => &args[0],
                    2 if args[0] == "a" => &args[1],
                    2 => return Err(line.bad_operands()),
                    _ => return Err(line.wrong_count(1)),
                };
                let index = match mnemonic.as_str() {
                    "add" => 0,
                    "adc" => 1,
                    "sub" => 2,
                    "sbc" => 3,
                    "and" => 4,
                    "xor" => 5,
                    "or" => 6,
                    _ => 7,
                };
                if let Some(r) = reg8(operand) {
                    out.push(0x80 | index << 3 | r);
                } else {
                    out.extend_from_slice(&[0xc6 | index << 3, line.byte(operand)?]);
                }
            }

            "ld" => {
                line.arg_count(2)?;
                line.encode_ld(&args[0], &args[1], out)?;
            }

            "ldi" | "ldd" => {
                line.arg_count(2)?;
                let inc = if mnemonic == "ldi" { 0x00 } else { 0x10 };
                match (args[0].as_str(), args[1].as_str()) {
                    ("a", "(hl)") => out.push(0x2a | inc),
                    ("(hl)", "a") => out.push(0x22 | inc),
                    _ => return Err(line.bad_operands()),
                }
            }

            "ldh" => {
                line.arg_count(2)?;
                match (indirect(&args[0]), indirect(&args[1])) {
                    (None, Some(src)) if args[0] == "a" => {
                        out.extend_from_slice(&[0xf0, line.byte(high_page(src).unwrap_or(src))?]);
                    }
                    (Some(dst), None) if args[1] == "a" => {
                        out.extend_from_slice(&[0xe0, line.byte(high_page(dst).unwrap_or(dst))?]);
                    }
                    _ => return Err(line.bad_operands()),
                }
            }

            "rlc" | "rrc" | "rl" | "rr" | "sla" | "sra" | "swap" | "srl" => {
                line.arg_count(1)?;
                let base = match mnemonic.as_str() {
                    "rlc" => 0x00,
                    "rrc" => 0x08,
                    "rl" => 0x10,
                    "rr" => 0x18,
                    "sla" => 0x20,
                    "sra" => 0x28,
                    "swap" => 0x30,
                    _ => 0x38,
                };
                let r = reg8(&args[0]).ok_or_else(|| line.bad_operands())?;
                out.extend_from_slice(&[0xcb, base | r]);
            }

            "bit" | "res" | "set" => {
                line.arg_count(2)?;
                let bit = line.byte(&args[0])?;
                if bit > 7 {
                    return Err(line.out_of_range(&args[0], "bit number (0-7)"));
                }
                let r = reg8(&args[1]).ok_or_else(|| line.bad_operands())?;
                let base = match mnemonic.as_str() {
                    "bit" => 0x40,
                    "res" => 0x80,
                    _ => 0xc0,
                };
                out.extend_from_slice(&[0xcb, base | bit << 3 | r]);
            }

            "db" => {
                if args.is_empty() {
                    return Err(line.wrong_count(1));
                }
                for arg in &args {
                    out.push(line.byte(arg)?);
                }
            }

            "dw" => {
                if args.is_empty() {
                    return Err(line.wrong_count(1));
                }
                for arg in &args {
                    out.extend_from_slice(&line.word(arg)?.to_le_bytes());
                }
            }

            _ => {
                return Err(AsmError::UnknownMnemonic {
                    instruction: instruction.to_string(),
                    mnemonic: mnemonic.clone(),
                });
            }
        }

        Ok(())
    }
}

impl Assembler for Sm83Assembler {
    fn compile(&self, source: &str) -> Result<Vec<u8>, AsmError> {
        let mut out = Vec::new();
        for raw in source.split(|c| c == ';' || c == '\n') {
            let instruction = raw.trim();
            if instruction.is_empty() || instruction.starts_with('#') || instruction.starts_with("//") {
                continue;
            }
            self.encode(instruction, &mut out)?;
        }
        Ok(out)
    }

    fn get_def(&self, name: &str) -> Result<Address, AsmError> {
        self.defs
            .get(&name.to_ascii_lowercase())
            .copied()
            .ok_or_else(|| AsmError::UnknownSymbol(name.to_string()))
    }

    fn define(&mut self, name: &str, addr: Address) -> Result<(), AsmError> {
        let key = name.to_ascii_lowercase();
        if let Some(&existing) = self.defs.get(&key) {
            return Err(AsmError::Redefined {
                name: name.to_string(),
                existing,
            });
        }
        self.defs.insert(key, addr);
        Ok(())
    }
}

fn implied_opcode(mnemonic: &str) -> Option<&'static [u8]> {
    let op: &'static [u8] = match mnemonic {
        "nop" => &[0x00],
        "stop" => &[0x10, 0x00],
        "halt" => &[0x76],
        "di" => &[0xf3],
        "ei" => &[0xfb],
        "scf" => &[0x37],
        "ccf" => &[0x3f],
        "cpl" => &[0x2f],
        "daa" => &[0x27],
        "rlca" => &[0x07],
        "rrca" => &[0x0f],
        "rla" => &[0x17],
        "rra" => &[0x1f],
        "reti" => &[0xd9],
        _ => return None,
    };
    Some(op)
}

fn reg8(s: &str) -> Option<u8> {
    Some(match s {
        "b" => 0,
        "c" => 1,
        "d" => 2,
        "e" => 3,
        "h" => 4,
        "l" => 5,
        "(hl)" => 6,
        "a" => 7,
        _ => return None,
    })
}

fn reg16(s: &str) -> Option<u8> {
    Some(match s {
        "bc" => 0,
        "de" => 1,
        "hl" => 2,
        "sp" => 3,
        _ => return None,
    })
}

fn indirect(s: &str) -> Option<&str> {
    s.strip_prefix('(').and_then(|s| s.strip_suffix(')'))
}

fn high_page(inner: &str) -> Option<&str> {
    inner.strip_prefix("ff00+")
}

fn parse_number(token: &str) -> Option<u32> {
    let digits = token
        .strip_prefix('$')
        .or_else(|| token.strip_prefix("0x"))
        .unwrap_or(token);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

/// One instruction being encoded, for operand helpers and error context.
struct Line<'a> {
    asm: &'a Sm83Assembler,
    instruction: &'a str,
    mnemonic: &'a str,
    args: &'a [String],
}

impl Line<'_> {
    fn wrong_count(&self, expected: usize) -> AsmError {
        AsmError::WrongArgCount {
            instruction: self.instruction.to_string(),
            mnemonic: self.mnemonic.to_string(),
            expected,
            got: self.args.len(),
        }
    }

    fn arg_count(&self, expected: usize) -> Result<(), AsmError> {
        if self.args.len() == expected {
            Ok(())
        } else {
            Err(self.wrong_count(expected))
        }
    }

    fn bad_operands(&self) -> AsmError {
        AsmError::BadOperands {
            instruction: self.instruction.to_string(),
            mnemonic: self.mnemonic.to_string(),
        }
    }

    fn out_of_range(&self, token: &str, kind: &'static str) -> AsmError {
        AsmError::ValueOutOfRange {
            instruction: self.instruction.to_string(),
            token: token.to_string(),
            kind,
        }
    }

    fn cond(&self, token: &str) -> Result<u8, AsmError> {
        match token {
            "nz" => Ok(0),
            "z" => Ok(1),
            "nc" => Ok(2),
            "c" => Ok(3),
            _ => Err(self.bad_operands()),
        }
    }

    /// Defined symbols win over numbers, so a routine named `fade` is not
    /// read as the hex literal `fade`.
    fn value(&self, token: &str) -> Result<u32, AsmError> {
        if let Ok(addr) = self.asm.get_def(token) {
            return Ok(u32::from(addr.offset));
        }
        if let Some(n) = parse_number(token) {
            return Ok(n);
        }
        if reg8(token).is_some() || reg16(token).is_some() || token.starts_with('(') {
            return Err(self.bad_operands());
        }
        Err(AsmError::UnknownSymbol(token.to_string()))
    }

    fn byte(&self, token: &str) -> Result<u8, AsmError> {
        let v = self.value(token)?;
        u8::try_from(v).map_err(|_| self.out_of_range(token, "byte"))
    }

    fn word(&self, token: &str) -> Result<u16, AsmError> {
        let v = self.value(token)?;
        u16::try_from(v).map_err(|_| self.out_of_range(token, "word"))
    }

    fn encode_ld(&self, dst: &str, src: &str, out: &mut Vec<u8>) -> Result<(), AsmError> {
        match (dst, src) {
            ("(hl)", "(hl)") => return Err(self.bad_operands()),
            ("a", "(bc)") => out.push(0x0a),
            ("a", "(de)") => out.push(0x1a),
            ("(bc)", "a") => out.push(0x02),
            ("(de)", "a") => out.push(0x12),
            ("a", "(hl+)") | ("a", "(hli)") => out.push(0x2a),
            ("a", "(hl-)") | ("a", "(hld)") => out.push(0x3a),
            ("(hl+)", "a") | ("(hli)", "a") => out.push(0x22),
            ("(hl-)", "a") | ("(hld)", "a") => out.push(0x32),
            ("a", "(c)") | ("a", "(ff00+c)") => out.push(0xf2),
            ("(c)", "a") | ("(ff00+c)", "a") => out.push(0xe2),
            ("sp", "hl") => out.push(0xf9),
            _ => {
                if let (Some(d), Some(s)) = (reg8(dst), reg8(src)) {
                    out.push(0x40 | d << 3 | s);
                } else if let Some(rr) = reg16(dst) {
                    out.push(0x01 | rr << 4);
                    out.extend_from_slice(&self.word(src)?.to_le_bytes());
                } else if let (Some(d), None) = (reg8(dst), indirect(src)) {
                    out.extend_from_slice(&[0x06 | d << 3, self.byte(src)?]);
                } else if let (Some(inner), "a") = (indirect(src), dst) {
                    match high_page(inner) {
                        Some(n) => out.extend_from_slice(&[0xf0, self.byte(n)?]),
                        None => {
                            out.push(0xfa);
                            out.extend_from_slice(&self.word(inner)?.to_le_bytes());
                        }
                    }
                } else if let (Some(inner), "a") = (indirect(dst), src) {
                    match high_page(inner) {
                        Some(n) => out.extend_from_slice(&[0xe0, self.byte(n)?]),
                        None => {
                            out.push(0xea);
                            out.extend_from_slice(&self.word(inner)?.to_le_bytes());
                        }
                    }
                } else if let (Some(inner), "sp") = (indirect(dst), src) {
                    out.push(0x08);
                    out.extend_from_slice(&self.word(inner)?.to_le_bytes());
                } else {
                    return Err(self.bad_operands());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asm() -> Sm83Assembler {
        Sm83Assembler::with_defs([
            ("filterMusic", Address::new(0x00, 0x3f10)),
            ("treeWarp", Address::new(0x02, 0x7e93)),
        ])
        .unwrap()
    }

    #[test]
    fn compiles_music_hook_sequence() {
        let bytes = asm().compile("ld h,a; ld a,(ff00+b7)").unwrap();
        assert_eq!(bytes, vec![0x67, 0xf0, 0xb7]);
    }

    #[test]
    fn resolves_symbols_little_endian() {
        let bytes = asm().compile("call filterMusic").unwrap();
        assert_eq!(bytes, vec![0xcd, 0x10, 0x3f]);
        let bytes = asm().compile("jp nz,treeWarp").unwrap();
        assert_eq!(bytes, vec![0xc2, 0x93, 0x7e]);
    }

    #[test]
    fn bare_numbers_are_hex() {
        let bytes = asm().compile("inc a; cp a,11").unwrap();
        assert_eq!(bytes, vec![0x3c, 0xfe, 0x11]);
        let bytes = asm().compile("ld hl,4610").unwrap();
        assert_eq!(bytes, vec![0x21, 0x10, 0x46]);
    }

    #[test]
    fn compiles_data_directives() {
        let bytes = asm().compile("db dd,2a,00").unwrap();
        assert_eq!(bytes, vec![0xdd, 0x2a, 0x00]);
        let bytes = asm().compile("db e0; dw filterMusic").unwrap();
        assert_eq!(bytes, vec![0xe0, 0x10, 0x3f]);
    }

    #[test]
    fn compiles_cb_prefixed_ops() {
        let bytes = asm().compile("ld b,a; swap a").unwrap();
        assert_eq!(bytes, vec![0x47, 0xcb, 0x37]);
        let bytes = asm().compile("set 6,c").unwrap();
        assert_eq!(bytes, vec![0xcb, 0xf1]);
        let bytes = asm().compile("bit 7,(hl)").unwrap();
        assert_eq!(bytes, vec![0xcb, 0x7e]);
    }

    #[test]
    fn compiles_memory_loads() {
        let bytes = asm().compile("ld a,(wMapMenu)").err();
        assert!(matches!(bytes, Some(AsmError::UnknownSymbol(ref s)) if s == "wmapmenu"));
        let bytes = asm().compile("ld a,(cc2d); ld (c648),a").unwrap();
        assert_eq!(bytes, vec![0xfa, 0x2d, 0xcc, 0xea, 0x48, 0xc6]);
        let bytes = asm().compile("ld (ff00+8f),a; ldi a,(hl); ld a,(de)").unwrap();
        assert_eq!(bytes, vec![0xe0, 0x8f, 0x2a, 0x1a]);
    }

    #[test]
    fn compiles_control_flow() {
        let bytes = asm().compile("ret nz\nret\nnop\njr z,05\nrst 18").unwrap();
        assert_eq!(bytes, vec![0xc0, 0xc9, 0x00, 0x28, 0x05, 0xdf]);
        let bytes = asm().compile("push bc; pop af; jp hl").unwrap();
        assert_eq!(bytes, vec![0xc5, 0xf1, 0xe9]);
    }

    #[test]
    fn skips_comments() {
        let bytes = asm().compile("# header\nnop\n// trailing").unwrap();
        assert_eq!(bytes, vec![0x00]);
    }

    #[test]
    fn rejects_unknown_mnemonics() {
        let err = asm().compile("frob a").unwrap_err();
        assert!(matches!(err, AsmError::UnknownMnemonic { .. }));
    }

    #[test]
    fn rejects_wide_immediates() {
        let err = asm().compile("cp a,100").unwrap_err();
        assert!(matches!(err, AsmError::ValueOutOfRange { kind: "byte", .. }));
    }

    #[test]
    fn rejects_redefinition() {
        let mut a = asm();
        let err = a.define("treeWarp", Address::new(0x02, 0x4000)).unwrap_err();
        assert!(matches!(err, AsmError::Redefined { .. }));
    }

    #[test]
    fn symbols_shadow_hex_literals() {
        let mut a = asm();
        a.define("fade", Address::new(0x00, 0x3ef8)).unwrap();
        assert_eq!(a.compile("call fade").unwrap(), vec![0xcd, 0xf8, 0x3e]);
        assert_eq!(a.compile("dw FADE").unwrap(), vec![0xf8, 0x3e]);
        // Undefined hex-looking tokens are still numbers.
        assert_eq!(a.compile("call beef").unwrap(), vec![0xcd, 0xef, 0xbe]);
    }
}
