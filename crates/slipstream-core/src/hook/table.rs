//! Hook site definitions.
//!
//! A `HookSpec` names a signature, where within the match the patch goes,
//! and how many bytes the patch displaces. The builtin table carries the
//! known sites for the supported target build; a JSON table on disk
//! overrides it when the target updates and the offsets move.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::error::{Error, Result};
use crate::layout::direct::DEFAULT_LOCAL_STRUCT_OFFSET;
use crate::process::{ProcessMemory, RemotePtr};
use crate::scan::ModuleScanner;

/// The six instrumentable sites, one per captured structure.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HookFamily {
    /// RPM, gear, and the dashboard struct base.
    Dashboard,
    /// Race timer context base.
    Timer,
    /// Race progress struct base.
    Progress,
    /// Race-state indicator; the only always-on capture.
    RaceState,
    /// Local player object pointer.
    LocalPlayer,
    /// Raw steering input.
    Steering,
}

/// One hookable site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookSpec {
    pub family: HookFamily,
    /// Space-separated hex bytes, `??` for wildcards.
    pub pattern: String,
    /// Byte offset from the pattern match to the patched instruction.
    #[serde(default)]
    pub hook_offset: usize,
    /// Bytes displaced by the patch; the jump is NOP-padded to this.
    pub patch_len: usize,
    /// Expected offset of the match from the module base, if known for
    /// this target build. Lets resolution skip the full scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_offset: Option<u64>,
    /// Permanent hooks stay installed across capture cycles.
    #[serde(default)]
    pub permanent: bool,
}

impl HookSpec {
    pub fn pattern_bytes(&self) -> Result<Vec<Option<u8>>> {
        parse_pattern(&self.pattern)
    }

    /// Address of the patched instruction given the pattern match.
    pub fn site(&self, matched: RemotePtr) -> RemotePtr {
        matched.offset(self.hook_offset as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookTable {
    pub entries: Vec<HookSpec>,
}

impl HookTable {
    pub fn entry(&self, family: HookFamily) -> Result<&HookSpec> {
        self.entries
            .iter()
            .find(|spec| spec.family == family)
            .ok_or_else(|| Error::InvalidHookTable(format!("no entry for family {family}")))
    }

    /// Reject tables a stub could not be built from.
    pub fn validate(&self) -> Result<()> {
        for spec in &self.entries {
            let pattern = spec.pattern_bytes()?;
            if spec.patch_len < crate::codec::JMP_REL32_LEN {
                return Err(Error::InvalidHookTable(format!(
                    "{}: patch_len {} cannot hold a jump",
                    spec.family, spec.patch_len
                )));
            }
            if spec.hook_offset + spec.patch_len > pattern.len() {
                return Err(Error::InvalidHookTable(format!(
                    "{}: hook_offset {} + patch_len {} exceeds the {}-byte pattern",
                    spec.family,
                    spec.hook_offset,
                    spec.patch_len,
                    pattern.len()
                )));
            }
        }
        Ok(())
    }
}

/// Hook sites for the supported target build.
pub fn builtin_hook_table() -> HookTable {
    HookTable {
        entries: vec![
            // movss [rdi+1B8h], xmm1
            HookSpec {
                family: HookFamily::Dashboard,
                pattern: "F3 0F 11 8F B8 01 00 00".to_string(),
                hook_offset: 0,
                patch_len: 8,
                static_offset: None,
                permanent: false,
            },
            // add [rdi+10h], rax / mov rdx, [rdi+F8h] / mov rax, [rdx+8]
            // patched at the second instruction.
            HookSpec {
                family: HookFamily::Timer,
                pattern: "48 01 47 10 48 8B 97 F8 00 00 00 48 8B 42 08".to_string(),
                hook_offset: 4,
                patch_len: 7,
                static_offset: None,
                permanent: false,
            },
            // mov [rdi+1D8h], eax
            HookSpec {
                family: HookFamily::Progress,
                pattern: "89 87 D8 01 00 00 48 83 C4 38".to_string(),
                hook_offset: 0,
                patch_len: 6,
                static_offset: None,
                permanent: false,
            },
            // xor rax, rsi / mov r14d, 10h; esi carries the indicator.
            HookSpec {
                family: HookFamily::RaceState,
                pattern: "48 33 C6 41 BE 10 00 00 00".to_string(),
                hook_offset: 0,
                patch_len: 9,
                static_offset: Some(0x5C_C82F),
                permanent: true,
            },
            // mov [rbx+8], rax / movss xmm1, [r14+130h]
            HookSpec {
                family: HookFamily::LocalPlayer,
                pattern: "48 89 43 08 F3 41 0F 10 8E 30 01 00 00".to_string(),
                hook_offset: 0,
                patch_len: 13,
                static_offset: None,
                permanent: false,
            },
            // movss [rsi+1540h], xmm1
            HookSpec {
                family: HookFamily::Steering,
                pattern: "F3 0F 11 8E 40 15 00 00 48 63 48".to_string(),
                hook_offset: 0,
                patch_len: 8,
                static_offset: None,
                permanent: true,
            },
        ],
    }
}

pub fn load_hook_table<P: AsRef<Path>>(path: P) -> Result<HookTable> {
    let content = fs::read_to_string(&path)?;
    let table: HookTable = serde_json::from_str(&content)?;
    table.validate()?;
    Ok(table)
}

pub fn save_hook_table<P: AsRef<Path>>(path: P, table: &HookTable) -> Result<()> {
    let content = serde_json::to_string_pretty(table)?;
    fs::write(path, content)?;
    Ok(())
}

/// Finds the displacement from the local-player pointer to the player
/// struct by anchoring on a known compare sequence and reading the
/// disp32 of the load instruction immediately before it. That load
/// dereferences the player pointer, so its displacement is exactly the
/// offset the reader needs.
pub struct StructOffsetProbe {
    pattern: Vec<Option<u8>>,
}

impl Default for StructOffsetProbe {
    fn default() -> Self {
        StructOffsetProbe {
            pattern: parse_pattern("83 B8 04 01 00 00 02 0F 95 C0")
                .unwrap_or_default(),
        }
    }
}

impl StructOffsetProbe {
    /// Probe the image; fall back to the known-good default if the
    /// instruction moved or changed shape.
    pub fn resolve<M: ProcessMemory + ?Sized>(
        &self,
        mem: &M,
        scanner: &ModuleScanner,
    ) -> u32 {
        match self.probe(mem, scanner) {
            Ok(offset) => offset,
            Err(e) => {
                tracing::warn!(
                    "struct offset probe failed ({e}), using default {:#x}",
                    DEFAULT_LOCAL_STRUCT_OFFSET
                );
                DEFAULT_LOCAL_STRUCT_OFFSET
            }
        }
    }

    fn probe<M: ProcessMemory + ?Sized>(
        &self,
        mem: &M,
        scanner: &ModuleScanner,
    ) -> Result<u32> {
        let matched = scanner
            .scan(mem, &self.pattern)?
            .ok_or_else(|| Error::SignatureNotFound("struct_offset_probe".to_string()))?;
        // The preceding load's disp32 ends right where the match starts.
        let disp = mem.read_u32(matched.saturating_sub(4))?;
        if disp == 0 || disp > 0x1000 {
            return Err(Error::SignatureNotFound(format!(
                "struct offset probe read implausible displacement {disp:#x}"
            )));
        }
        Ok(disp)
    }
}

pub fn parse_pattern(pattern: &str) -> Result<Vec<Option<u8>>> {
    let mut bytes = Vec::new();
    for token in pattern.split_whitespace() {
        if token == "??" || token == "?" {
            bytes.push(None);
            continue;
        }
        let value = u8::from_str_radix(token, 16).map_err(|e| {
            Error::InvalidHookTable(format!("invalid pattern token '{token}': {e}"))
        })?;
        bytes.push(Some(value));
    }
    if bytes.is_empty() {
        return Err(Error::InvalidHookTable("pattern is empty".to_string()));
    }
    Ok(bytes)
}

pub fn format_pattern(bytes: &[Option<u8>]) -> String {
    bytes
        .iter()
        .map(|b| match b {
            Some(value) => format!("{value:02X}"),
            None => "??".to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
