//! Binaries referenced by a broker message.

use ingest_types::{BrokerMessage, CloudFile};

/// Every cloud file a message points at: file fields and conversation
/// attachments.
pub(crate) fn cloud_files_mut(bm: &mut BrokerMessage) -> Vec<&mut CloudFile> {
    let mut out = Vec::new();
    for field in bm.files.values_mut() {
        if let Some(file) = field.file.as_mut() {
            out.push(file);
        }
    }
    for conversation in bm.conversations.values_mut() {
        for message in conversation.messages.iter_mut() {
            out.extend(message.attachments.iter_mut());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_types::{Conversation, FieldFile, Message};

    #[test]
    fn test_collects_files_and_attachments() {
        let mut bm = BrokerMessage::default();
        bm.files.insert(
            "doc".into(),
            FieldFile {
                file: Some(CloudFile {
                    uri: "r1/f/doc".into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        bm.files.insert("empty".into(), FieldFile::default());
        bm.conversations.insert(
            "chat".into(),
            Conversation {
                messages: vec![Message {
                    attachments: vec![CloudFile::default(), CloudFile::default()],
                    ..Default::default()
                }],
            },
        );
        assert_eq!(cloud_files_mut(&mut bm).len(), 3);
    }
}
