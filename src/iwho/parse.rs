//! Parsing of textual basic blocks into concrete instructions.
//!
//! Seed blocks for generalization arrive as Intel-syntax assembly files.
//! Parsing matches each line against the scheme universe; a line that does
//! not fit any known scheme is an input error.

use super::{
    register_by_name, BasicBlock, Instruction, InsnScheme, IwhoError, Operand, OperandKind,
    SchemeContext,
};

#[derive(Debug, Clone)]
enum ParsedOperand {
    Reg { class: super::AliasClass, width: u16 },
    Mem { width: Option<u16>, base: super::AliasClass, displacement: i64 },
    Imm(i64),
}

fn parse_int(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()
    } else if let Some(hex) = text.strip_prefix("-0x") {
        i64::from_str_radix(hex, 16).ok().map(|v| -v)
    } else {
        text.parse().ok()
    }
}

fn parse_memory(text: &str) -> Result<ParsedOperand, IwhoError> {
    let err = || IwhoError::MalformedOperand(text.to_string());

    let (width, rest) = if let Some(idx) = text.find("ptr") {
        let size = text[..idx].trim();
        let width = match size {
            "byte" => 8,
            "word" => 16,
            "dword" => 32,
            "qword" => 64,
            "xmmword" => 128,
            _ => return Err(err()),
        };
        (Some(width), text[idx + 3..].trim())
    } else {
        (None, text)
    };

    let inner = rest
        .strip_prefix('[')
        .and_then(|r| r.strip_suffix(']'))
        .ok_or_else(err)?;

    let (base_txt, disp) = match inner.find(|c| c == '+' || c == '-') {
        Some(idx) => {
            let sign = if inner.as_bytes()[idx] == b'-' { -1 } else { 1 };
            let disp = parse_int(&inner[idx + 1..]).ok_or_else(err)?;
            (&inner[..idx], sign * disp)
        }
        None => (inner, 0),
    };

    let base_txt = base_txt.trim();
    let (base, base_width) = register_by_name(base_txt)
        .ok_or_else(|| IwhoError::UnknownRegister(base_txt.to_string()))?;
    if base_width != 64 {
        return Err(err());
    }
    Ok(ParsedOperand::Mem { width, base, displacement: disp })
}

fn parse_operand(text: &str) -> Result<ParsedOperand, IwhoError> {
    let text = text.trim();
    if text.contains('[') {
        return parse_memory(text);
    }
    if let Some((class, width)) = register_by_name(text) {
        return Ok(ParsedOperand::Reg { class, width });
    }
    if let Some(value) = parse_int(text) {
        return Ok(ParsedOperand::Imm(value));
    }
    Err(IwhoError::MalformedOperand(text.to_string()))
}

/// Split an instruction line into mnemonic and operand texts. Operands are
/// comma-separated, but commas inside memory brackets do not occur in the
/// syntax this accepts.
fn split_line(line: &str) -> (String, Vec<String>) {
    let line = line.trim();
    match line.find(char::is_whitespace) {
        None => (line.to_string(), vec![]),
        Some(idx) => {
            let mnemonic = line[..idx].to_string();
            let ops = line[idx..]
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
            (mnemonic, ops)
        }
    }
}

fn operand_fits(scheme_op: &OperandKind, parsed: &ParsedOperand) -> bool {
    match (scheme_op, parsed) {
        (OperandKind::Reg { bank, width }, ParsedOperand::Reg { class, width: pw }) => {
            class.bank() == *bank && width == pw
        }
        (OperandKind::Mem { width }, ParsedOperand::Mem { width: pw, .. }) => {
            pw.map_or(true, |w| w == *width)
        }
        (OperandKind::Imm { width }, ParsedOperand::Imm(value)) => {
            let bits = 64 - value.unsigned_abs().leading_zeros() as u16;
            bits <= *width
        }
        _ => false,
    }
}

fn instantiate(scheme: &InsnScheme, id: super::SchemeId, parsed: &[ParsedOperand]) -> Instruction {
    let mut parsed_it = parsed.iter();
    let operands = scheme
        .operands
        .iter()
        .map(|os| {
            if os.implicit {
                return Operand::Flags;
            }
            match (parsed_it.next().unwrap(), &os.kind) {
                (ParsedOperand::Reg { class, width }, _) => {
                    Operand::Reg { class: *class, width: *width }
                }
                (ParsedOperand::Mem { base, displacement, .. }, OperandKind::Mem { width }) => {
                    Operand::Mem { width: *width, base: *base, displacement: *displacement }
                }
                (ParsedOperand::Imm(value), OperandKind::Imm { width }) => {
                    Operand::Imm { width: *width, value: *value }
                }
                _ => unreachable!("operand fit was checked before instantiation"),
            }
        })
        .collect();
    Instruction { scheme: id, operands }
}

/// Parse one instruction against the filtered scheme universe.
pub fn parse_insn(ctx: &SchemeContext, line: &str) -> Result<Instruction, IwhoError> {
    let (mnemonic, op_texts) = split_line(line);
    let parsed = op_texts
        .iter()
        .map(|t| parse_operand(t))
        .collect::<Result<Vec<_>, _>>()?;

    for &id in ctx.filtered_schemes() {
        let scheme = ctx.scheme(id);
        if scheme.mnemonic != mnemonic {
            continue;
        }
        let explicit: Vec<_> = scheme.explicit_operands().collect();
        if explicit.len() != parsed.len() {
            continue;
        }
        let fits = explicit
            .iter()
            .zip(parsed.iter())
            .all(|((_, os), p)| operand_fits(&os.kind, p));
        if fits {
            return Ok(instantiate(scheme, id, &parsed));
        }
    }
    Err(IwhoError::UnknownInstruction(line.trim().to_string()))
}

/// Parse a whole basic block. Empty lines and `#`/`;` comment lines are
/// skipped.
pub fn parse_block(ctx: &SchemeContext, text: &str) -> Result<BasicBlock, IwhoError> {
    let mut insns = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        insns.push(parse_insn(ctx, line)?);
    }
    Ok(BasicBlock::new(insns))
}
