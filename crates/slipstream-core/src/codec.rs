//! x86-64 jump and displacement encoding.
//!
//! Pure functions; no state. All displacements are computed from the
//! address of the byte immediately *after* the rel32 field (the
//! instruction-pointer value at execution time), not from the opcode
//! address. Getting this wrong shifts every jump by the instruction
//! length, so the convention is enforced here and tested explicitly.

use crate::error::{Error, Result};
use crate::process::RemotePtr;

/// Length of an E9 rel32 jump.
pub const JMP_REL32_LEN: usize = 5;

/// Length of an FF 25 absolute indirect jump with an inline 8-byte target.
pub const JMP_ABS_LEN: usize = 14;

const NOP: u8 = 0x90;

/// Encode the 4-byte little-endian displacement used by E9 jumps and
/// RIP-relative memory operands.
///
/// `next_ip` is the address of the instruction that follows the rel32
/// field. Fails if the displacement does not fit a signed 32-bit range;
/// the caller must then fall back to [`jmp_abs`].
pub fn rel32(next_ip: RemotePtr, target: RemotePtr) -> Result<[u8; 4]> {
    let delta = target.get().wrapping_sub(next_ip.get()) as i64;
    if delta < i32::MIN as i64 || delta > i32::MAX as i64 {
        return Err(Error::DisplacementOverflow {
            from: next_ip,
            to: target,
        });
    }
    Ok((delta as i32).to_le_bytes())
}

/// 5-byte E9 relative jump. `at` is the address of the opcode byte.
pub fn jmp_rel32(at: RemotePtr, target: RemotePtr) -> Result<[u8; 5]> {
    let disp = rel32(at.offset(JMP_REL32_LEN as u64), target)?;
    let mut out = [0u8; 5];
    out[0] = 0xE9;
    out[1..].copy_from_slice(&disp);
    Ok(out)
}

/// 14-byte absolute indirect jump: `FF 25 00000000` followed by the
/// 8-byte target, i.e. `jmp [rip+0]`. Reaches any address.
pub fn jmp_abs(target: RemotePtr) -> [u8; 14] {
    let mut out = [0u8; 14];
    out[..6].copy_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    out[6..].copy_from_slice(&target.get().to_le_bytes());
    out
}

/// Emit a relative jump when the target is in range, otherwise the
/// absolute form. Used for the jump back out of a stub, where the return
/// address is always nearby but the fallback keeps the builder total.
pub fn jmp_auto(at: RemotePtr, target: RemotePtr) -> Vec<u8> {
    match jmp_rel32(at, target) {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => jmp_abs(target).to_vec(),
    }
}

/// Pad `patch` with NOPs up to `site_len` so the patched site keeps the
/// original instruction boundary.
///
/// The patch must not be longer than the site it replaces.
pub fn pad_to_site(patch: &[u8], site_len: usize) -> Result<Vec<u8>> {
    if patch.len() > site_len {
        return Err(Error::InvalidHookTable(format!(
            "patch of {} bytes does not fit a {}-byte hook site",
            patch.len(),
            site_len
        )));
    }
    let mut out = patch.to_vec();
    out.resize(site_len, NOP);
    Ok(out)
}
