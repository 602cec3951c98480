// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error {0}")]
    Parse(#[from] serde_json::Error),

    #[error("routing table error {0}")]
    Mrt(#[from] mrt::Error),

    #[error("invalid config: {0}")]
    Config(String),
}
