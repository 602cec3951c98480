// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// daemon
macro_rules! dlog {
    ($log:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_PIMD,
            "module" => crate::MOD_DAEMON,
            "unit" => crate::UNIT_DAEMON,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_PIMD,
            "module" => crate::MOD_DAEMON,
            "unit" => crate::UNIT_DAEMON,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_PIMD,
            "module" => crate::MOD_DAEMON,
            "unit" => crate::UNIT_DAEMON
        )
    };
    ($log:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_PIMD,
            "module" => crate::MOD_DAEMON,
            "unit" => crate::UNIT_DAEMON,
        )
    };
}

// forwarding cache stand-in
macro_rules! klog {
    ($log:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_PIMD,
            "module" => crate::MOD_LOWER,
            "unit" => crate::UNIT_KERNEL,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_PIMD,
            "module" => crate::MOD_LOWER,
            "unit" => crate::UNIT_KERNEL,
            $($key => $value),*
        )
    };
}

// protocol notifications
macro_rules! plog {
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_PIMD,
            "module" => crate::MOD_DAEMON,
            "unit" => crate::UNIT_PROTOCOL,
            $($key => $value),*
        )
    };
}

// signal
macro_rules! sig_log {
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_PIMD,
            "module" => crate::MOD_DAEMON,
            "unit" => crate::UNIT_SIGNAL,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_PIMD,
            "module" => crate::MOD_DAEMON,
            "unit" => crate::UNIT_SIGNAL
        )
    };
}

pub(crate) use dlog;
pub(crate) use klog;
pub(crate) use plog;
pub(crate) use sig_log;
