use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    Local,
    Peer,
}

/// One message of a live conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: Uuid,
    pub author: Author,
    pub text: String,
    pub sequence: u64,
    pub timestamp: u64,
}

/// In-memory record of the current session. Gone when the session ends.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TranscriptEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn texts(&self) -> impl Iterator<Item = (Author, &str)> {
        self.entries.iter().map(|e| (e.author, e.text.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order() {
        let mut transcript = Transcript::new();
        assert!(transcript.is_empty());
        for (author, text, seq) in [(Author::Local, "hi", 0), (Author::Peer, "hello", 0)] {
            transcript.push(TranscriptEntry {
                id: Uuid::new_v4(),
                author,
                text: text.into(),
                sequence: seq,
                timestamp: 1,
            });
        }
        assert_eq!(transcript.len(), 2);
        let texts: Vec<_> = transcript.texts().collect();
        assert_eq!(texts, vec![(Author::Local, "hi"), (Author::Peer, "hello")]);
    }

    #[test]
    fn author_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Author::Peer).unwrap(), "\"peer\"");
    }
}
