// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::flexi_logger::{
    Logger,
    LoggerHandle,
};
use ::std::{
    mem,
    sync::Once,
};

//==============================================================================
// Static Variables
//==============================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

//==============================================================================
// Standalone Functions
//==============================================================================

/// Initializes logging features. The log specification is read from `RUST_LOG` and defaults to `info`.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        let handle: LoggerHandle = match Logger::try_with_env_or_str("info").and_then(|logger| logger.start()) {
            Ok(handle) => handle,
            Err(e) => {
                eprintln!("initialize(): failed to start logger ({:?})", e);
                return;
            },
        };
        // The handle shuts the logger down when dropped.
        mem::forget(handle);
    });
}
