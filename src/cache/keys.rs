//! Type-safe key builders for the durable result slot

use std::fmt;

pub const VERSION: &str = "v1";

pub mod payment_result {
    use super::*;

    pub const NAMESPACE: &str = "payment_result";

    /// Key under which the bridge parks its latest result.
    #[derive(Debug, Clone)]
    pub struct SlotKey {
        pub terminal_id: String,
    }

    impl SlotKey {
        pub fn new(terminal_id: impl Into<String>) -> Self {
            Self {
                terminal_id: terminal_id.into(),
            }
        }
    }

    impl fmt::Display for SlotKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:slot:{}", VERSION, NAMESPACE, self.terminal_id)
        }
    }

    /// Pub/sub channel carrying slot change notifications.
    #[derive(Debug, Clone)]
    pub struct ChangeChannelKey {
        pub terminal_id: String,
    }

    impl ChangeChannelKey {
        pub fn new(terminal_id: impl Into<String>) -> Self {
            Self {
                terminal_id: terminal_id.into(),
            }
        }
    }

    impl fmt::Display for ChangeChannelKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:changed:{}", VERSION, NAMESPACE, self.terminal_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::payment_result::*;

    #[test]
    fn slot_keys_are_versioned_and_namespaced() {
        assert_eq!(SlotKey::new("kiosk-01").to_string(), "v1:payment_result:slot:kiosk-01");
        assert_eq!(
            ChangeChannelKey::new("kiosk-01").to_string(),
            "v1:payment_result:changed:kiosk-01"
        );
    }
}
