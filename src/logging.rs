// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::flexi_logger::Logger;
use ::std::sync::Once;

//==============================================================================
// Static Variables
//==============================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

//==============================================================================
// Standalone Functions
//==============================================================================

/// Initializes logging features. Log levels are taken from the `RUST_LOG` environment variable.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        if let Ok(logger) = Logger::try_with_env() {
            if let Ok(handle) = logger.start() {
                // The handle shuts the logger down on drop; keep it alive for the process lifetime.
                ::std::mem::forget(handle);
            }
        }
    });
}
