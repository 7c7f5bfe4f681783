//! Item kinds of an export stream.

/// Kind of one entry in an export stream, identified by a 3-byte tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportedItemType {
    Resource,
    Binary,
    EntitiesGroups,
    Labels,
    LearningConfig,
}

impl ExportedItemType {
    pub const TAG_LEN: usize = 3;

    pub fn tag(&self) -> &'static [u8; 3] {
        match self {
            ExportedItemType::Resource => b"RES",
            ExportedItemType::Binary => b"BIN",
            ExportedItemType::EntitiesGroups => b"ENT",
            ExportedItemType::Labels => b"LAB",
            ExportedItemType::LearningConfig => b"LEA",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"RES" => Some(ExportedItemType::Resource),
            b"BIN" => Some(ExportedItemType::Binary),
            b"ENT" => Some(ExportedItemType::EntitiesGroups),
            b"LAB" => Some(ExportedItemType::Labels),
            b"LEA" => Some(ExportedItemType::LearningConfig),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags() {
        assert_eq!(ExportedItemType::Binary.tag(), b"BIN");
        assert_eq!(
            ExportedItemType::from_tag(b"LEA"),
            Some(ExportedItemType::LearningConfig)
        );
        assert_eq!(ExportedItemType::from_tag(b"XYZ"), None);
        assert_eq!(ExportedItemType::from_tag(b"RE"), None);
    }
}
