// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cooperative shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};

/// Exit status of a process killed by SIGINT.
const SIGINT_EXIT_CODE: i32 = 130;

/// Shared stop request, checked by the transport loop between steps.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancel `token` on the first Ctrl+C. A second one exits immediately.
pub fn install_interrupt_handler(token: &ShutdownToken) -> Result<(), ctrlc::Error> {
    let token = token.clone();
    ctrlc::set_handler(move || {
        if token.is_cancelled() {
            warn!("Interrupted again, exiting");
            std::process::exit(SIGINT_EXIT_CODE);
        }
        info!("Quit");
        token.cancel();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = ShutdownToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }
}
