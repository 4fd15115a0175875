//! Hook sites, stub construction, and patch lifecycle.

pub mod manager;
pub mod stub;
mod table;

pub use manager::{CleanupRegistry, HookManager, InstalledHook};
pub use stub::{StubImage, DATA_OFFSET, STUB_PAGE_SIZE};
pub use table::{
    builtin_hook_table, format_pattern, load_hook_table, parse_pattern, save_hook_table,
    HookFamily, HookSpec, HookTable, StructOffsetProbe,
};
