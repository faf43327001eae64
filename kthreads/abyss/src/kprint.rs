//! Kernel print utilities.

use crate::spinlock::SpinLock;
use std::{
    io::Write,
    sync::atomic::{AtomicU32, Ordering},
};

bitflags::bitflags! {
    /// Categories of debug messages.
    ///
    /// A `debug!` message is printed only if its category is enabled.
    pub struct DebugFlags: u32 {
        /// Thread lifecycle and scheduling (`t`).
        const THREAD = 1 << 0;
        /// Alarm waits and expirations (`a`).
        const ALARM = 1 << 1;
        /// Condition variables (`c`).
        const CONDITION = 1 << 2;
        /// Mutexes, rendezvous and reactions (`s`).
        const SYNC = 1 << 3;
        /// Interrupt delivery and clock ticks (`i`).
        const INTERRUPT = 1 << 4;
        /// Machine setup and teardown (`m`).
        const MACHINE = 1 << 5;
    }
}

impl DebugFlags {
    /// Parses a string of flag characters such as `"tc"`.
    ///
    /// `+` enables every category. Returns `None` on an unknown character.
    pub fn from_chars(s: &str) -> Option<Self> {
        s.chars().try_fold(Self::empty(), |flags, c| {
            Some(
                flags
                    | match c {
                        't' => Self::THREAD,
                        'a' => Self::ALARM,
                        'c' => Self::CONDITION,
                        's' => Self::SYNC,
                        'i' => Self::INTERRUPT,
                        'm' => Self::MACHINE,
                        '+' => Self::all(),
                        _ => return None,
                    },
            )
        })
    }
}

static DEBUG_FLAGS: AtomicU32 = AtomicU32::new(0);

/// Replaces the set of enabled debug categories.
pub fn set_debug_flags(flags: DebugFlags) {
    DEBUG_FLAGS.store(flags.bits(), Ordering::SeqCst);
}

/// Returns true if messages of the `flag` category are printed.
pub fn debug_enabled(flag: DebugFlags) -> bool {
    DebugFlags::from_bits_truncate(DEBUG_FLAGS.load(Ordering::SeqCst)).intersects(flag)
}

static CONSOLE: SpinLock<()> = SpinLock::new(());

#[doc(hidden)]
pub fn _print(fmt: std::fmt::Arguments<'_>) {
    let guard = CONSOLE.lock();
    let mut stderr = std::io::stderr().lock();
    let _ = stderr.write_fmt(fmt);
    let _ = stderr.flush();
    guard.unlock();
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the console.
/// This first holds the lock for console device.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the console.
/// This first holds the lock for console device.
#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    () => (if !$crate::QUIET.load(std::sync::atomic::Ordering::SeqCst) { $crate::kprint!("[INFO]\n") });
    ($($arg:tt)*) => (if !$crate::QUIET.load(std::sync::atomic::Ordering::SeqCst) { $crate::kprint!("[INFO] {}\n", format_args!($($arg)*)) });
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    () => (if !$crate::QUIET.load(std::sync::atomic::Ordering::SeqCst) { $crate::kprint!("[WARN]\n") });
    ($($arg:tt)*) => (if !$crate::QUIET.load(std::sync::atomic::Ordering::SeqCst) { $crate::kprint!("[WARN] {}\n", format_args!($($arg)*)) });
}

/// Display a debug message of the given category.
///
/// ```ignore
/// debug!(THREAD, "Forking thread: {}", thread);
/// ```
#[macro_export]
macro_rules! debug {
    ($flag:ident, $($arg:tt)*) => (
        if $crate::kprint::debug_enabled($crate::kprint::DebugFlags::$flag) {
            $crate::kprint!("[DEBUG] {}\n", format_args!($($arg)*))
        }
    );
}

#[cfg(test)]
mod tests {
    use super::DebugFlags;

    #[test]
    fn parse_flags() {
        assert_eq!(
            DebugFlags::from_chars("tc"),
            Some(DebugFlags::THREAD | DebugFlags::CONDITION)
        );
        assert_eq!(DebugFlags::from_chars("+"), Some(DebugFlags::all()));
        assert_eq!(DebugFlags::from_chars(""), Some(DebugFlags::empty()));
        assert_eq!(DebugFlags::from_chars("tx"), None);
    }
}
