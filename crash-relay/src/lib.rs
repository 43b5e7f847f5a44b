//! Out-of-process crash relay.
//!
//! The process being monitored spawns a helper process early in its lifetime,
//! waits for the helper to report that it is listening, and then goes about its
//! business. When a crash is detected, the crash context is handed verbatim to
//! the helper over a pre-established channel, so that the actual work of
//! writing a dump never runs inside the compromised process.
//!
//! The monitored side is driven by [`Session`], whose [`CrashBridge`] is what
//! a crash handler calls from its (signal handler restricted) crash callback.
//! The helper side is driven by [`helper::run`], which starts a [`DumpServer`]
//! and blocks on a [`CompletionSync`] until the dump has been written.
//!
//! # Linux
//!
//! Control bytes travel over a pipe, the crash context over one end of a
//! connected `SOCK_SEQPACKET` socket pair. Both helper-side descriptors are
//! passed to the helper as positional arguments.
//!
//! # Macos
//!
//! Control bytes travel over a pipe, the crash context is sent as a mach
//! message. The receive right for the port is handed to the helper by
//! temporarily swapping the task's bootstrap port before spawning, so only the
//! pipe descriptor is passed as an argument.

// BEGIN - Embark standard lints v6 for Rust 1.55+
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::flat_map_option,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::from_iter_instead_of_collect,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_digit_groups,
    clippy::large_stack_arrays,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wild_err_arm,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::missing_enforced_import_renames,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_for_each,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::rc_mutex,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v6 for Rust 1.55+
// crate-specific exceptions:
#![allow(unsafe_code)]

pub mod bridge;
pub mod channel;
pub mod completion;
mod errors;
pub mod handshake;
pub mod helper;
pub mod launch;
pub mod server;

pub use bridge::CrashBridge;
pub use completion::CompletionSync;
pub use errors::Error;
pub use handshake::Readiness;
pub use helper::HelperChannelIds;
pub use launch::{ProcessHandle, Session};
pub use server::{DumpServer, ServerHandler};

use std::{path::PathBuf, time::Duration};

/// The amount of time the monitored process waits for the helper to signal
/// that it is ready to receive a crash context
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

/// The file name of the helper executable, which is expected to live in the
/// same directory as the executable of the monitored process
pub const HELPER_NAME: &str = "handler";

/// Environment variable used to pass the dump directory to the helper process
pub const DUMP_DIR_ENV: &str = "CRASH_RELAY_DUMP_DIR";

/// The largest crash context that can be relayed to the helper
pub const MAX_BLOB_SIZE: usize = 8 * 1024;

/// Settings for a crash reporting session, supplied by the monitored process
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// The directory dumps are written to. This is passed opaquely to the dump
    /// writer in the helper process, it is neither validated nor created here.
    pub dump_dir: PathBuf,
    /// File name of the helper executable, resolved relative to the directory
    /// of the current executable
    pub helper_name: String,
    /// The maximum amount of time to wait for the helper to become ready
    pub handshake_timeout: Duration,
}

impl RelayConfig {
    pub fn new(dump_dir: impl Into<PathBuf>) -> Self {
        Self {
            dump_dir: dump_dir.into(),
            helper_name: HELPER_NAME.to_owned(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_stderr(s: &'static str) {
    // SAFETY: syscall
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}
