// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/// Default size of a fiber stack.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Number of spins a plain thread performs on a baton before parking.
pub const BATON_SPIN_ATTEMPTS: usize = 300;

/// Word used to fill fiber stacks when stack usage recording is enabled.
pub const STACK_MAGIC: u64 = 0xfaceb00cfaceb00c;

/// Page size assumed when the system does not report one.
pub const DEFAULT_PAGE_SIZE: usize = 4096;
