#![allow(dead_code)]

use bytes::Bytes;
use seqcrdt_core::{ListCrdt, Operation, Position, PositionSource, ReplicaId};

/// A broadcast message with the per-author counts its author had applied when it was made.
#[derive(Clone, Debug)]
pub struct Envelope<M> {
    pub message: M,
    pub deps: Vec<usize>,
}

/// Causal broadcast bookkeeping between a fixed set of replicas.
///
/// Every replica's messages are logged in order; a replica may take the next message of
/// one author only once everything that message depends on has arrived.
pub struct Causal<M> {
    applied: Vec<Vec<usize>>,
    log: Vec<Vec<Envelope<M>>>,
}

impl<M: Clone> Causal<M> {
    pub fn new(replicas: usize) -> Self {
        Self {
            applied: vec![vec![0; replicas]; replicas],
            log: vec![Vec::new(); replicas],
        }
    }

    /// Logs a message `author` already applied locally.
    pub fn record(&mut self, author: usize, message: M) {
        let deps = self.applied[author].clone();
        self.applied[author][author] += 1;
        self.log[author].push(Envelope { message, deps });
    }

    pub fn next_ready(&self, replica: usize, author: usize) -> Option<M> {
        if replica == author {
            return None;
        }
        let envelope = self.log[author].get(self.applied[replica][author])?;
        let ready = envelope
            .deps
            .iter()
            .enumerate()
            .all(|(other, &needed)| other == author || self.applied[replica][other] >= needed);
        ready.then(|| envelope.message.clone())
    }

    pub fn mark_delivered(&mut self, replica: usize, author: usize) {
        self.applied[replica][author] += 1;
    }
}

/// Repeatedly calls `deliver(replica, author)` over every pair until none progresses.
fn drain(replicas: usize, mut deliver: impl FnMut(usize, usize) -> bool) {
    loop {
        let mut progressed = false;
        for replica in 0..replicas {
            for author in 0..replicas {
                while deliver(replica, author) {
                    progressed = true;
                }
            }
        }
        if !progressed {
            break;
        }
    }
}

/// Embedded-mode replicas exchanging operations.
pub struct Network {
    pub replicas: Vec<ListCrdt<char>>,
    causal: Causal<Operation<char>>,
}

impl Network {
    pub fn new(names: &[&str]) -> Self {
        let replicas = names
            .iter()
            .map(|name| ListCrdt::new(ReplicaId::new(name.as_bytes())).unwrap())
            .collect();
        Self {
            replicas,
            causal: Causal::new(names.len()),
        }
    }

    pub fn insert(&mut self, author: usize, index: usize, value: char) {
        let op = self.replicas[author].insert(index, value).unwrap();
        self.causal.record(author, op);
    }

    pub fn insert_str(&mut self, author: usize, index: usize, text: &str) {
        let op = self.replicas[author]
            .insert_many(index, text.chars().collect())
            .unwrap();
        self.causal.record(author, op);
    }

    pub fn delete(&mut self, author: usize, index: usize) {
        let op = self.replicas[author].delete(index).unwrap();
        self.causal.record(author, op);
    }

    /// Delivers the next operation of `author` to `replica` if it is causally ready.
    pub fn deliver(&mut self, replica: usize, author: usize) -> bool {
        let Some(op) = self.causal.next_ready(replica, author) else {
            return false;
        };
        self.replicas[replica].apply_remote(op).unwrap();
        self.causal.mark_delivered(replica, author);
        true
    }

    pub fn deliver_all(&mut self) {
        drain(self.replicas.len(), |replica, author| {
            self.deliver(replica, author)
        });
    }

    pub fn text(&self, replica: usize) -> String {
        self.replicas[replica].values().collect()
    }

    pub fn texts(&self) -> Vec<String> {
        (0..self.replicas.len()).map(|r| self.text(r)).collect()
    }
}

/// What a detached replica broadcasts.
#[derive(Clone, Debug)]
pub enum SourceMessage {
    Created {
        start: Position,
        count: usize,
        metadata: Option<Bytes>,
    },
    Deleted(Position),
}

/// Detached-mode replicas exchanging created and deleted positions.
pub struct SourceNetwork {
    pub sources: Vec<PositionSource>,
    causal: Causal<SourceMessage>,
}

impl SourceNetwork {
    pub fn with_initial(names: &[&str], initial: usize) -> Self {
        let sources = names
            .iter()
            .map(|name| PositionSource::with_initial(ReplicaId::new(name.as_bytes()), initial))
            .collect::<Result<_, _>>()
            .unwrap();
        Self {
            sources,
            causal: Causal::new(names.len()),
        }
    }

    pub fn create(&mut self, author: usize, index: usize, count: usize) -> Position {
        let (start, metadata) = self.sources[author]
            .create_positions(index, count)
            .unwrap();
        let message = SourceMessage::Created {
            start: start.clone(),
            count,
            metadata,
        };
        Self::apply(&mut self.sources[author], &message);
        self.causal.record(author, message);
        start
    }

    pub fn delete(&mut self, author: usize, index: usize) {
        let position = self.sources[author].get(index).unwrap();
        let message = SourceMessage::Deleted(position);
        Self::apply(&mut self.sources[author], &message);
        self.causal.record(author, message);
    }

    pub fn deliver(&mut self, replica: usize, author: usize) -> bool {
        let Some(message) = self.causal.next_ready(replica, author) else {
            return false;
        };
        Self::apply(&mut self.sources[replica], &message);
        self.causal.mark_delivered(replica, author);
        true
    }

    pub fn deliver_all(&mut self) {
        drain(self.sources.len(), |replica, author| {
            self.deliver(replica, author)
        });
    }

    pub fn positions(&self, replica: usize) -> Vec<Position> {
        self.sources[replica].positions().collect()
    }

    fn apply(source: &mut PositionSource, message: &SourceMessage) {
        match message {
            SourceMessage::Created {
                start,
                count,
                metadata,
            } => source
                .receive_and_add_positions(start, *count, metadata.as_deref())
                .unwrap(),
            SourceMessage::Deleted(position) => {
                source.delete(position).unwrap();
            }
        }
    }
}
