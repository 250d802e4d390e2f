//! Incremental multi-algorithm hashing.

use sha2::Digest as _;

use crate::hash::{Algorithm, Hash, Integrity};

enum State {
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
    Blake3(Box<blake3::Hasher>),
}

impl State {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha256 => State::Sha256(sha2::Sha256::new()),
            Algorithm::Sha384 => State::Sha384(sha2::Sha384::new()),
            Algorithm::Sha512 => State::Sha512(sha2::Sha512::new()),
            Algorithm::Blake3 => State::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            State::Sha256(h) => h.update(data),
            State::Sha384(h) => h.update(data),
            State::Sha512(h) => h.update(data),
            State::Blake3(h) => {
                h.update(data);
            }
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            State::Sha256(h) => h.finalize().to_vec(),
            State::Sha384(h) => h.finalize().to_vec(),
            State::Sha512(h) => h.finalize().to_vec(),
            State::Blake3(h) => h.finalize().as_bytes().to_vec(),
        }
    }
}

/// Streaming hasher producing an [`Integrity`] over every configured
/// algorithm at once.
///
/// Duplicate algorithms are collapsed; an empty algorithm list falls back to
/// [`Algorithm::default`].
pub struct IntegrityHasher {
    states: Vec<(Algorithm, State)>,
    bytes_hashed: u64,
}

impl IntegrityHasher {
    pub fn new(algorithms: &[Algorithm]) -> Self {
        let mut states: Vec<(Algorithm, State)> = Vec::with_capacity(algorithms.len().max(1));
        for algorithm in algorithms {
            if !states.iter().any(|(a, _)| a == algorithm) {
                states.push((*algorithm, State::new(*algorithm)));
            }
        }
        if states.is_empty() {
            let algorithm = Algorithm::default();
            states.push((algorithm, State::new(algorithm)));
        }

        Self {
            states,
            bytes_hashed: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        for (_, state) in self.states.iter_mut() {
            state.update(data);
        }
        self.bytes_hashed += data.len() as u64;
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    pub fn finish(self) -> Integrity {
        let hashes = self
            .states
            .into_iter()
            .map(|(algorithm, state)| Hash::new(algorithm, state.finalize()))
            .collect::<Result<Vec<_>, _>>()
            .expect("hasher output length always matches its algorithm");
        Integrity::from_hashes(hashes).expect("hasher always holds at least one algorithm")
    }
}
