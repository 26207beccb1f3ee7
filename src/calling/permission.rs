//! Microphone permission gate.

use async_trait::async_trait;

/// Both call initiation and acceptance require a granted microphone.
#[async_trait]
pub trait MicrophonePermission: Send + Sync {
    async fn is_microphone_granted(&self) -> bool;

    /// Prompt for the permission. Returns whether it is granted afterwards.
    async fn request_microphone(&self) -> bool;
}

/// Check, then prompt if needed.
pub async fn ensure_microphone(permission: &dyn MicrophonePermission) -> bool {
    if permission.is_microphone_granted().await {
        return true;
    }
    tracing::info!("Requesting microphone permission");
    permission.request_microphone().await
}

/// Fixed answer, for headless use.
#[derive(Debug, Clone, Copy)]
pub struct StaticPermission {
    granted: bool,
}

impl StaticPermission {
    pub fn new(granted: bool) -> Self {
        Self { granted }
    }
}

#[async_trait]
impl MicrophonePermission for StaticPermission {
    async fn is_microphone_granted(&self) -> bool {
        self.granted
    }

    async fn request_microphone(&self) -> bool {
        self.granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PromptGrants {
        prompts: AtomicUsize,
    }

    #[async_trait]
    impl MicrophonePermission for PromptGrants {
        async fn is_microphone_granted(&self) -> bool {
            false
        }

        async fn request_microphone(&self) -> bool {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn test_ensure_prompts_only_when_needed() {
        assert!(ensure_microphone(&StaticPermission::new(true)).await);
        assert!(!ensure_microphone(&StaticPermission::new(false)).await);

        let p = PromptGrants {
            prompts: AtomicUsize::new(0),
        };
        assert!(ensure_microphone(&p).await);
        assert_eq!(p.prompts.load(Ordering::SeqCst), 1);
    }
}
