// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// The unit key resolves at the call site, so each module using this macro
// defines its own `LOG_UNIT`.
macro_rules! mrt_log {
    ($self:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_MRT,
            "module" => crate::MOD_ENGINE,
            "unit" => LOG_UNIT,
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_MRT,
            "module" => crate::MOD_ENGINE,
            "unit" => LOG_UNIT,
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_MRT,
            "module" => crate::MOD_ENGINE,
            "unit" => LOG_UNIT,
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_MRT,
            "module" => crate::MOD_ENGINE,
            "unit" => LOG_UNIT,
        )
    };
}

pub(crate) use mrt_log;
