//! Stub page construction.
//!
//! A stub is a one-page trampoline: a short capture prologue that spills
//! the interesting registers into data cells on the same page, the
//! displaced original instruction bytes, and a jump back to the
//! instruction after the patched site. Data cells start at
//! [`DATA_OFFSET`]; the prologue must stay below it.
//!
//! Register choices per family follow the instruction each site patches:
//! the struct base rides in `rdi` at the dashboard, timer, and progress
//! sites, in `rax` at the local-player store, and the live values arrive
//! in `xmm1`, `eax`, or `esi`. Steering is the odd one out: the hooked
//! store writes the wheel angle, so the stub reads the normalized input
//! field off `rsi` instead of spilling a register.

use crate::codec;
use crate::error::{Error, Result};
use crate::hook::table::HookFamily;
use crate::layout::direct::{GEAR, STEERING_INPUT};
use crate::process::RemotePtr;

/// Size of every stub allocation.
pub const STUB_PAGE_SIZE: usize = 0x1000;

/// Offset of the data-cell region within a stub page.
pub const DATA_OFFSET: u64 = 64;

/// Data-cell offsets within the cell region, per family.
pub mod cell {
    /// f32 bits straight from xmm1.
    pub const DASH_RPM_RAW: u64 = 0;
    /// Truncated integer RPM.
    pub const DASH_RPM_INT: u64 = 4;
    pub const DASH_GEAR: u64 = 8;
    pub const DASH_BASE: u64 = 12;

    /// Live timer value, for liveness checks.
    pub const TIMER_VALUE: u64 = 0;
    pub const TIMER_BASE: u64 = 8;

    /// f32 bits of the progress fraction.
    pub const PROGRESS_VALUE: u64 = 0;
    pub const PROGRESS_BASE: u64 = 4;

    pub const RACE_STATE_VALUE: u64 = 0;

    pub const LOCAL_PLAYER_BASE: u64 = 0;

    /// f32 bits of the raw steering input.
    pub const STEERING_INPUT: u64 = 0;
}

/// Address of a data cell on a stub page.
pub fn cell_addr(page: RemotePtr, cell: u64) -> RemotePtr {
    page.offset(DATA_OFFSET + cell)
}

/// A fully built stub: the page image to write and the site patch that
/// diverts execution into it.
pub struct StubImage {
    /// Page-sized image; prologue at offset 0, zeroed cells at
    /// [`DATA_OFFSET`].
    pub bytes: Vec<u8>,
    /// Jump to the page, NOP-padded to the displaced length.
    pub patch: Vec<u8>,
}

/// Build the stub for `family` on an already allocated `page`.
///
/// `displaced` is the original instruction bytes read from the site; they
/// are replayed verbatim after the capture prologue, so the site must be
/// patched at an instruction boundary and `displaced` must cover whole
/// instructions.
pub fn build(
    family: HookFamily,
    page: RemotePtr,
    site: RemotePtr,
    displaced: &[u8],
) -> Result<StubImage> {
    let mut asm = Asm::new(page);
    match family {
        HookFamily::Dashboard => {
            asm.store_xmm1(cell::DASH_RPM_RAW)?;
            asm.push_rax();
            asm.cvttss2si_eax_xmm1();
            asm.store_eax(cell::DASH_RPM_INT)?;
            asm.load_eax_rdi_disp(GEAR as u32);
            asm.store_eax(cell::DASH_GEAR)?;
            asm.pop_rax();
            asm.store_rdi(cell::DASH_BASE)?;
        }
        HookFamily::Timer => {
            asm.push_rax();
            // mov rax, [rdi+10h]: the running timer itself.
            asm.raw(&[0x48, 0x8B, 0x47, 0x10]);
            asm.store_rax(cell::TIMER_VALUE)?;
            asm.pop_rax();
            asm.store_rdi(cell::TIMER_BASE)?;
        }
        HookFamily::Progress => {
            asm.store_eax(cell::PROGRESS_VALUE)?;
            asm.store_rdi(cell::PROGRESS_BASE)?;
        }
        HookFamily::RaceState => {
            asm.store_esi(cell::RACE_STATE_VALUE)?;
        }
        HookFamily::LocalPlayer => {
            asm.store_rax(cell::LOCAL_PLAYER_BASE)?;
        }
        HookFamily::Steering => {
            asm.push_rax();
            // mov eax, [rsi+1544h]: the normalized input; xmm1 carries
            // the wheel angle at this site.
            asm.load_eax_rsi_disp(STEERING_INPUT as u32);
            asm.store_eax(cell::STEERING_INPUT)?;
            asm.pop_rax();
        }
    }
    asm.raw(displaced);
    asm.jmp_back(site.offset(displaced.len() as u64));

    let code = asm.finish()?;
    let mut bytes = vec![0u8; STUB_PAGE_SIZE];
    bytes[..code.len()].copy_from_slice(&code);

    let jmp = codec::jmp_rel32(site, page)?;
    let patch = codec::pad_to_site(&jmp, displaced.len())?;
    Ok(StubImage { bytes, patch })
}

/// Minimal emitter for the handful of encodings the prologues use. All
/// cell stores are RIP-relative, so stubs never touch a register they do
/// not save.
struct Asm {
    page: RemotePtr,
    code: Vec<u8>,
}

impl Asm {
    fn new(page: RemotePtr) -> Self {
        Asm {
            page,
            code: Vec::new(),
        }
    }

    fn pos(&self) -> RemotePtr {
        self.page.offset(self.code.len() as u64)
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Opcode (including a ModRM with rm=101) followed by a disp32 that
    /// resolves to the given data cell at execution time.
    fn rip_store(&mut self, opcode: &[u8], cell: u64) -> Result<()> {
        let next_ip = self.pos().offset(opcode.len() as u64 + 4);
        let disp = codec::rel32(next_ip, cell_addr(self.page, cell))?;
        self.code.extend_from_slice(opcode);
        self.code.extend_from_slice(&disp);
        Ok(())
    }

    /// mov [rip+cell], rdi
    fn store_rdi(&mut self, cell: u64) -> Result<()> {
        self.rip_store(&[0x48, 0x89, 0x3D], cell)
    }

    /// mov [rip+cell], rax
    fn store_rax(&mut self, cell: u64) -> Result<()> {
        self.rip_store(&[0x48, 0x89, 0x05], cell)
    }

    /// mov [rip+cell], eax
    fn store_eax(&mut self, cell: u64) -> Result<()> {
        self.rip_store(&[0x89, 0x05], cell)
    }

    /// mov [rip+cell], esi
    fn store_esi(&mut self, cell: u64) -> Result<()> {
        self.rip_store(&[0x89, 0x35], cell)
    }

    /// movss [rip+cell], xmm1
    fn store_xmm1(&mut self, cell: u64) -> Result<()> {
        self.rip_store(&[0xF3, 0x0F, 0x11, 0x0D], cell)
    }

    fn push_rax(&mut self) {
        self.code.push(0x50);
    }

    fn pop_rax(&mut self) {
        self.code.push(0x58);
    }

    /// cvttss2si eax, xmm1
    fn cvttss2si_eax_xmm1(&mut self) {
        self.raw(&[0xF3, 0x0F, 0x2C, 0xC1]);
    }

    /// mov eax, [rdi+disp32]
    fn load_eax_rdi_disp(&mut self, disp: u32) {
        self.raw(&[0x8B, 0x87]);
        self.code.extend_from_slice(&disp.to_le_bytes());
    }

    /// mov eax, [rsi+disp32]
    fn load_eax_rsi_disp(&mut self, disp: u32) {
        self.raw(&[0x8B, 0x86]);
        self.code.extend_from_slice(&disp.to_le_bytes());
    }

    fn jmp_back(&mut self, target: RemotePtr) {
        let bytes = codec::jmp_auto(self.pos(), target);
        self.code.extend_from_slice(&bytes);
    }

    fn finish(self) -> Result<Vec<u8>> {
        if self.code.len() as u64 > DATA_OFFSET {
            return Err(Error::InvalidHookTable(format!(
                "stub prologue of {} bytes overruns the data region",
                self.code.len()
            )));
        }
        Ok(self.code)
    }
}
