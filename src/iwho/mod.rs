//! Instruction scheme universe and (dis)assembly front-end boundary.
//!
//! The discovery engine never inspects x86 encodings itself. Everything it
//! knows about instructions comes from this module: a universe of
//! parameterized instruction forms ("schemes"), the operands they take, the
//! register aliasing structure of x86-64, and textual assembly in Intel
//! syntax. Scheme universes are loaded from a JSON database file or built
//! programmatically (mainly by tests).

pub mod parse;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IwhoError {
    #[error("failed to read scheme universe from {path}: {reason}")]
    SchemeFile { path: PathBuf, reason: String },

    #[error("duplicate instruction scheme: {0}")]
    DuplicateScheme(String),

    #[error("unknown register name: {0}")]
    UnknownRegister(String),

    #[error("no instruction scheme matches '{0}'")]
    UnknownInstruction(String),

    #[error("malformed operand: {0}")]
    MalformedOperand(String),

    #[error("failed to read filter list {path}: {reason}")]
    FilterFile { path: PathBuf, reason: String },

    #[error("instruction universe is empty after filtering")]
    EmptyUniverse,
}

/// Register banks. Flag registers exist only as implicit operands and never
/// take part in aliasing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegBank {
    Gpr,
    Xmm,
}

/// An x86 aliasing class: all architectural names for the same physical
/// register (`rax`/`eax`/`ax`/`al` share one class). Classes 0..16 are the
/// general-purpose registers, 16..32 the xmm registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AliasClass(pub u16);

const NUM_GPR_CLASSES: u16 = 16;

impl AliasClass {
    pub fn bank(self) -> RegBank {
        if self.0 < NUM_GPR_CLASSES {
            RegBank::Gpr
        } else {
            RegBank::Xmm
        }
    }
}

struct GprNames {
    w64: &'static str,
    w32: &'static str,
    w16: &'static str,
    w8: &'static str,
}

#[rustfmt::skip]
static GPR_NAMES: [GprNames; 16] = [
    GprNames { w64: "rax", w32: "eax",  w16: "ax",   w8: "al"   },
    GprNames { w64: "rcx", w32: "ecx",  w16: "cx",   w8: "cl"   },
    GprNames { w64: "rdx", w32: "edx",  w16: "dx",   w8: "dl"   },
    GprNames { w64: "rbx", w32: "ebx",  w16: "bx",   w8: "bl"   },
    GprNames { w64: "rsp", w32: "esp",  w16: "sp",   w8: "spl"  },
    GprNames { w64: "rbp", w32: "ebp",  w16: "bp",   w8: "bpl"  },
    GprNames { w64: "rsi", w32: "esi",  w16: "si",   w8: "sil"  },
    GprNames { w64: "rdi", w32: "edi",  w16: "di",   w8: "dil"  },
    GprNames { w64: "r8",  w32: "r8d",  w16: "r8w",  w8: "r8b"  },
    GprNames { w64: "r9",  w32: "r9d",  w16: "r9w",  w8: "r9b"  },
    GprNames { w64: "r10", w32: "r10d", w16: "r10w", w8: "r10b" },
    GprNames { w64: "r11", w32: "r11d", w16: "r11w", w8: "r11b" },
    GprNames { w64: "r12", w32: "r12d", w16: "r12w", w8: "r12b" },
    GprNames { w64: "r13", w32: "r13d", w16: "r13w", w8: "r13b" },
    GprNames { w64: "r14", w32: "r14d", w16: "r14w", w8: "r14b" },
    GprNames { w64: "r15", w32: "r15d", w16: "r15w", w8: "r15b" },
];

/// The architectural name of the register in `class` at bit width `width`.
pub fn register_name(class: AliasClass, width: u16) -> &'static str {
    match class.bank() {
        RegBank::Gpr => {
            let names = &GPR_NAMES[class.0 as usize];
            match width {
                64 => names.w64,
                32 => names.w32,
                16 => names.w16,
                8 => names.w8,
                _ => panic!("no gpr of width {}", width),
            }
        }
        RegBank::Xmm => {
            static XMM_NAMES: [&str; 16] = [
                "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9",
                "xmm10", "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
            ];
            XMM_NAMES[(class.0 - NUM_GPR_CLASSES) as usize]
        }
    }
}

/// Look up a register name, yielding its aliasing class and bit width.
pub fn register_by_name(name: &str) -> Option<(AliasClass, u16)> {
    for (idx, names) in GPR_NAMES.iter().enumerate() {
        let class = AliasClass(idx as u16);
        for &(n, w) in &[(names.w64, 64), (names.w32, 32), (names.w16, 16), (names.w8, 8)] {
            if n == name {
                return Some((class, w));
            }
        }
    }
    if let Some(rest) = name.strip_prefix("xmm") {
        if let Ok(n) = rest.parse::<u16>() {
            if n < 16 {
                return Some((AliasClass(NUM_GPR_CLASSES + n), 128));
            }
        }
    }
    None
}

/// Registers the sampler must never hand out: the stack pointer, the
/// registers the measurement harnesses keep for themselves, and the memory
/// base pool (which only memory operands may use).
pub fn reserved_gpr_classes() -> &'static [AliasClass] {
    // rsp, rbp, rsi, rdi, r14, r15
    static RESERVED: [AliasClass; 6] = [
        AliasClass(4),
        AliasClass(5),
        AliasClass(6),
        AliasClass(7),
        AliasClass(14),
        AliasClass(15),
    ];
    &RESERVED
}

/// Base registers for sampled memory operands. These get a backing
/// allocation from the measurement harness, with a displacement applied so
/// that rbp works without a special encoding.
pub fn memory_base_classes() -> &'static [AliasClass] {
    // rbp, rsi, rdi
    static BASES: [AliasClass; 3] = [AliasClass(5), AliasClass(6), AliasClass(7)];
    &BASES
}

/// Displacements paired with the memory base pool.
pub const MEMORY_DISPLACEMENTS: [i64; 2] = [64, 128];

/// Register classes an operand of the given bank may be instantiated with.
pub fn samplable_classes(bank: RegBank) -> Vec<AliasClass> {
    match bank {
        RegBank::Gpr => (0..NUM_GPR_CLASSES)
            .map(AliasClass)
            .filter(|c| !reserved_gpr_classes().contains(c))
            .collect(),
        RegBank::Xmm => (NUM_GPR_CLASSES..NUM_GPR_CLASSES + 16).map(AliasClass).collect(),
    }
}

/// The kind of a scheme operand.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OperandKind {
    Reg { bank: RegBank, width: u16 },
    Mem { width: u16 },
    Imm { width: u16 },
    Flags,
}

impl OperandKind {
    pub fn can_alias(&self) -> bool {
        matches!(self, OperandKind::Reg { .. } | OperandKind::Mem { .. })
    }

    fn tag(&self) -> String {
        match self {
            OperandKind::Reg { width, bank: RegBank::Gpr } => format!("R{}", width),
            OperandKind::Reg { width, bank: RegBank::Xmm } => format!("X{}", width),
            OperandKind::Mem { width } => format!("M{}", width),
            OperandKind::Imm { width } => format!("I{}", width),
            OperandKind::Flags => "FLAGS".to_string(),
        }
    }
}

/// One operand slot of an instruction scheme.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperandScheme {
    pub name: String,
    #[serde(flatten)]
    pub kind: OperandKind,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub written: bool,
    #[serde(default)]
    pub implicit: bool,
}

impl OperandScheme {
    pub fn reg(name: &str, width: u16, read: bool, written: bool) -> Self {
        OperandScheme {
            name: name.to_string(),
            kind: OperandKind::Reg { bank: RegBank::Gpr, width },
            read,
            written,
            implicit: false,
        }
    }

    pub fn xmm(name: &str, read: bool, written: bool) -> Self {
        OperandScheme {
            name: name.to_string(),
            kind: OperandKind::Reg { bank: RegBank::Xmm, width: 128 },
            read,
            written,
            implicit: false,
        }
    }

    pub fn mem(name: &str, width: u16, read: bool, written: bool) -> Self {
        OperandScheme {
            name: name.to_string(),
            kind: OperandKind::Mem { width },
            read,
            written,
            implicit: false,
        }
    }

    pub fn imm(name: &str, width: u16) -> Self {
        OperandScheme {
            name: name.to_string(),
            kind: OperandKind::Imm { width },
            read: true,
            written: false,
            implicit: false,
        }
    }

    pub fn flags(read: bool, written: bool) -> Self {
        OperandScheme {
            name: "flags".to_string(),
            kind: OperandKind::Flags,
            read,
            written,
            implicit: true,
        }
    }

    /// Textual tag used by the `opschemes` feature, e.g. `RW:M64`.
    pub fn feature_tag(&self) -> String {
        let rw = match (self.read, self.written) {
            (true, true) => "RW",
            (false, true) => "W",
            _ => "R",
        };
        format!("{}:{}", rw, self.kind.tag())
    }
}

/// A parameterized instruction form. The canonical `name` doubles as the
/// stable identifier in serialized data and filter lists.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InsnScheme {
    #[serde(skip)]
    pub name: String,
    pub mnemonic: String,
    pub operands: Vec<OperandScheme>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default, rename = "isa-set")]
    pub isa_set: Option<String>,
    #[serde(default)]
    pub affects_control_flow: bool,
}

impl InsnScheme {
    pub fn new(mnemonic: &str, operands: Vec<OperandScheme>) -> Self {
        let mut res = InsnScheme {
            name: String::new(),
            mnemonic: mnemonic.to_string(),
            operands,
            category: None,
            extension: None,
            isa_set: None,
            affects_control_flow: false,
        };
        res.name = res.canonical_name();
        res
    }

    pub fn with_attrs(mut self, category: &str, extension: &str, isa_set: &str) -> Self {
        self.category = Some(category.to_string());
        self.extension = Some(extension.to_string());
        self.isa_set = Some(isa_set.to_string());
        self
    }

    fn canonical_name(&self) -> String {
        let ops = self
            .operands
            .iter()
            .filter(|o| !o.implicit)
            .map(|o| o.kind.tag())
            .collect::<Vec<_>>()
            .join(", ");
        if ops.is_empty() {
            self.mnemonic.clone()
        } else {
            format!("{} {}", self.mnemonic, ops)
        }
    }

    pub fn explicit_operands(&self) -> impl Iterator<Item = (usize, &OperandScheme)> {
        self.operands.iter().enumerate().filter(|(_, o)| !o.implicit)
    }

    pub fn accesses_memory(&self) -> bool {
        self.operands.iter().any(|o| matches!(o.kind, OperandKind::Mem { .. }))
    }
}

/// Identifier of a scheme within one `SchemeContext`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemeId(pub u32);

/// A concrete operand value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    Reg { class: AliasClass, width: u16 },
    Mem { width: u16, base: AliasClass, displacement: i64 },
    Imm { width: u16, value: i64 },
    Flags,
}

impl Operand {
    /// Whether two concrete operands denote the same storage location.
    pub fn must_alias(&self, other: &Operand) -> bool {
        match (self, other) {
            (Operand::Reg { class: a, .. }, Operand::Reg { class: b, .. }) => a == b,
            (
                Operand::Mem { base: a, displacement: da, .. },
                Operand::Mem { base: b, displacement: db, .. },
            ) => a == b && da == db,
            _ => false,
        }
    }

    /// Whether two concrete operands can overlap. With memory operands drawn
    /// from the fixed base/displacement pool, overlap coincides with
    /// equality of base and displacement.
    pub fn may_alias(&self, other: &Operand) -> bool {
        self.must_alias(other)
    }

    fn render(&self) -> String {
        match self {
            Operand::Reg { class, width } => register_name(*class, *width).to_string(),
            Operand::Mem { width, base, displacement } => {
                let size = match width {
                    8 => "byte",
                    16 => "word",
                    32 => "dword",
                    64 => "qword",
                    128 => "xmmword",
                    _ => "qword",
                };
                format!(
                    "{} ptr [{} + 0x{:x}]",
                    size,
                    register_name(*base, 64),
                    displacement
                )
            }
            Operand::Imm { value, .. } => format!("0x{:x}", value),
            Operand::Flags => String::new(),
        }
    }
}

/// A concrete instruction: a scheme with all operand slots filled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub scheme: SchemeId,
    pub operands: Vec<Operand>,
}

/// A straight-line sequence of concrete instructions.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BasicBlock {
    pub insns: Vec<Instruction>,
}

impl BasicBlock {
    pub fn new(insns: Vec<Instruction>) -> Self {
        BasicBlock { insns }
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    pub fn asm(&self, ctx: &SchemeContext) -> String {
        self.insns
            .iter()
            .map(|insn| ctx.render_insn(insn))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Filters restricting the instruction universe before abstraction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UniverseFilter {
    /// Drop schemes that affect control flow.
    NoCf,
    /// Keep only schemes that carry the attribute set predictors are keyed
    /// on (category/extension/isa-set).
    WithMeasurements,
    Blacklist { file_path: PathBuf },
    Whitelist { file_path: PathBuf },
}

fn read_filter_list(path: &Path) -> Result<Vec<String>, IwhoError> {
    let content = fs::read_to_string(path).map_err(|e| IwhoError::FilterFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(content
        .lines()
        .map(|l| l.split(';').next().unwrap_or("").trim().to_string())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect())
}

/// The instruction universe: all known schemes plus the filtered subset the
/// engine actually works on.
pub struct SchemeContext {
    schemes: Vec<InsnScheme>,
    by_name: HashMap<String, SchemeId>,
    filtered: Vec<SchemeId>,
}

impl SchemeContext {
    pub fn from_schemes(schemes: Vec<InsnScheme>) -> Result<Self, IwhoError> {
        let mut by_name = HashMap::new();
        let mut named = Vec::with_capacity(schemes.len());
        for mut scheme in schemes {
            if scheme.name.is_empty() {
                scheme.name = scheme.canonical_name();
            }
            let id = SchemeId(named.len() as u32);
            if by_name.insert(scheme.name.clone(), id).is_some() {
                return Err(IwhoError::DuplicateScheme(scheme.name));
            }
            named.push(scheme);
        }
        let filtered = (0..named.len() as u32).map(SchemeId).collect();
        Ok(SchemeContext { schemes: named, by_name, filtered })
    }

    /// Load a scheme universe from a JSON database file. The context
    /// specifier of a configuration names such a file.
    pub fn from_spec_file(path: &Path) -> Result<Self, IwhoError> {
        let content = fs::read_to_string(path).map_err(|e| IwhoError::SchemeFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let schemes: Vec<InsnScheme> =
            serde_json::from_str(&content).map_err(|e| IwhoError::SchemeFile {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Self::from_schemes(schemes)
    }

    pub fn apply_filters(&mut self, filters: &[UniverseFilter]) -> Result<(), IwhoError> {
        for filter in filters {
            match filter {
                UniverseFilter::NoCf => {
                    let schemes = &self.schemes;
                    self.filtered.retain(|id| !schemes[id.0 as usize].affects_control_flow);
                }
                UniverseFilter::WithMeasurements => {
                    let schemes = &self.schemes;
                    self.filtered.retain(|id| schemes[id.0 as usize].category.is_some());
                }
                UniverseFilter::Blacklist { file_path } => {
                    let listed = read_filter_list(file_path)?;
                    let schemes = &self.schemes;
                    self.filtered
                        .retain(|id| !listed.iter().any(|n| *n == schemes[id.0 as usize].name));
                }
                UniverseFilter::Whitelist { file_path } => {
                    let listed = read_filter_list(file_path)?;
                    let schemes = &self.schemes;
                    self.filtered
                        .retain(|id| listed.iter().any(|n| *n == schemes[id.0 as usize].name));
                }
            }
        }
        if self.filtered.is_empty() {
            return Err(IwhoError::EmptyUniverse);
        }
        Ok(())
    }

    pub fn scheme(&self, id: SchemeId) -> &InsnScheme {
        &self.schemes[id.0 as usize]
    }

    pub fn num_schemes(&self) -> usize {
        self.schemes.len()
    }

    /// Scheme ids surviving the universe filters, in ascending order.
    pub fn filtered_schemes(&self) -> &[SchemeId] {
        &self.filtered
    }

    pub fn find_scheme(&self, name: &str) -> Option<SchemeId> {
        self.by_name.get(name).copied()
    }

    pub fn render_insn(&self, insn: &Instruction) -> String {
        let scheme = self.scheme(insn.scheme);
        let ops = scheme
            .operands
            .iter()
            .zip(insn.operands.iter())
            .filter(|(os, _)| !os.implicit)
            .map(|(_, op)| op.render())
            .collect::<Vec<_>>()
            .join(", ");
        if ops.is_empty() {
            scheme.mnemonic.clone()
        } else {
            format!("{} {}", scheme.mnemonic, ops)
        }
    }

    /// A fixed, valid instantiation of a scheme. Used to probe predictors
    /// with one representative instruction per scheme.
    pub fn default_instance(&self, id: SchemeId) -> Instruction {
        let scheme = self.scheme(id);
        let operands = scheme
            .operands
            .iter()
            .map(|os| match &os.kind {
                OperandKind::Reg { bank, width } => {
                    Operand::Reg { class: samplable_classes(*bank)[0], width: *width }
                }
                OperandKind::Mem { width } => Operand::Mem {
                    width: *width,
                    base: memory_base_classes()[0],
                    displacement: MEMORY_DISPLACEMENTS[0],
                },
                OperandKind::Imm { width } => Operand::Imm { width: *width, value: 42 },
                OperandKind::Flags => Operand::Flags,
            })
            .collect();
        Instruction { scheme: id, operands }
    }
}

impl fmt::Debug for SchemeContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "SchemeContext({} schemes, {} filtered)",
            self.schemes.len(),
            self.filtered.len()
        )
    }
}
