/// GATT layout of the tag's protocol service
///
/// The tag exposes one primary service with three characteristics: requests are
/// written to `Command`, responses arrive on `Response` and unsolicited
/// notifications on `Notify`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol service UUID
pub const TAG_SERVICE_UUID: Uuid = Uuid::from_u128(0xD45C2000_4270_A125_A25D_EE458C085001);

/// Command characteristic UUID (write)
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0xD45C2010_4270_A125_A25D_EE458C085001);

/// Response characteristic UUID (notify)
pub const RESPONSE_CHAR_UUID: Uuid = Uuid::from_u128(0xD45C2030_4270_A125_A25D_EE458C085001);

/// Notification characteristic UUID (notify)
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0xD45C2011_4270_A125_A25D_EE458C085001);

/// Characteristic roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagCharacteristic {
    /// Host to tag requests
    Command,
    /// Tag to host responses
    Response,
    /// Tag to host notifications
    Notify,
}

impl TagCharacteristic {
    pub const ALL: [TagCharacteristic; 3] = [
        TagCharacteristic::Command,
        TagCharacteristic::Response,
        TagCharacteristic::Notify,
    ];

    /// Whether notifications must be enabled before the link is usable
    pub fn requires_notify(&self) -> bool {
        matches!(self, TagCharacteristic::Response | TagCharacteristic::Notify)
    }
}

/// Concrete UUIDs for each characteristic role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCharacteristics {
    pub command: Uuid,
    pub response: Uuid,
    pub notify: Uuid,
}

impl Default for TagCharacteristics {
    fn default() -> Self {
        Self {
            command: COMMAND_CHAR_UUID,
            response: RESPONSE_CHAR_UUID,
            notify: NOTIFY_CHAR_UUID,
        }
    }
}

impl TagCharacteristics {
    pub fn uuid(&self, role: TagCharacteristic) -> Uuid {
        match role {
            TagCharacteristic::Command => self.command,
            TagCharacteristic::Response => self.response,
            TagCharacteristic::Notify => self.notify,
        }
    }

    pub fn role_of(&self, uuid: &Uuid) -> Option<TagCharacteristic> {
        TagCharacteristic::ALL
            .into_iter()
            .find(|role| self.uuid(*role) == *uuid)
    }
}
