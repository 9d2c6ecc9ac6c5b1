// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use thiserror::Error;

/// The ways `Roots::create` can fail. A failed `create` has no side effects.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Error)]
pub enum Error {
    /// No pool had a free slot and the pool source could not provide a new pool.
    #[error("pool memory exhausted")]
    Exhausted,
    /// The allocator was used before `setup` or after `teardown`.
    #[error("root allocator is not set up")]
    NotSetUp,
}
