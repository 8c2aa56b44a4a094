//! ISAAC keystream cipher
//!
//! Each session owns two independently keyed ISAAC generators: one decrypts
//! what the client sends, the other encrypts what the server sends. Both are
//! seeded from the key pair exchanged in the login block. Every byte of a
//! frame (opcode, length prefix and payload) consumes one keystream value.
//!
//! Reference: http://www.burtleburtle.net/bob/rand/isaacafa.html

use std::fmt;

/// Size of the ISAAC state array (must be a power of 2)
const SIZE: usize = 256;

const MASK: usize = SIZE - 1;

const GOLDEN_RATIO: u32 = 0x9e3779b9;

/// Offset added to every seed word for the server-to-client direction
pub const ENCODER_SEED_OFFSET: u32 = 50;

/// ISAAC generator state
#[derive(Clone)]
pub struct Isaac {
    results: [u32; SIZE],
    memory: [u32; SIZE],
    aa: u32,
    bb: u32,
    cc: u32,
    /// Unread values left in `results`, consumed from the top down
    remaining: usize,
}

impl Isaac {
    /// Seed a generator. Only the first 256 words of `seed` are used.
    pub fn new(seed: &[u32]) -> Self {
        let mut isaac = Self {
            results: [0; SIZE],
            memory: [0; SIZE],
            aa: 0,
            bb: 0,
            cc: 0,
            remaining: 0,
        };
        for (slot, &word) in isaac.results.iter_mut().zip(seed) {
            *slot = word;
        }
        isaac.seed_memory();
        isaac
    }

    fn seed_memory(&mut self) {
        let mut state = [GOLDEN_RATIO; 8];
        for _ in 0..4 {
            scramble(&mut state);
        }

        // Two passes: first over the seed words, then over the memory they produced
        for pass in 0..2 {
            for base in (0..SIZE).step_by(8) {
                let source = if pass == 0 {
                    &self.results[base..base + 8]
                } else {
                    &self.memory[base..base + 8]
                };
                for (word, add) in state.iter_mut().zip(source) {
                    *word = word.wrapping_add(*add);
                }
                scramble(&mut state);
                self.memory[base..base + 8].copy_from_slice(&state);
            }
        }

        self.refill();
    }

    /// Produce the next 256 keystream words
    fn refill(&mut self) {
        self.cc = self.cc.wrapping_add(1);
        self.bb = self.bb.wrapping_add(self.cc);

        for i in 0..SIZE {
            let x = self.memory[i];
            let shifted = match i & 3 {
                0 => self.aa << 13,
                1 => self.aa >> 6,
                2 => self.aa << 2,
                _ => self.aa >> 16,
            };
            self.aa = (self.aa ^ shifted).wrapping_add(self.memory[(i + 128) & MASK]);

            let y = self.memory[(x >> 2) as usize & MASK]
                .wrapping_add(self.aa)
                .wrapping_add(self.bb);
            self.memory[i] = y;
            self.bb = self.memory[(y >> 10) as usize & MASK].wrapping_add(x);
            self.results[i] = self.bb;
        }

        self.remaining = SIZE;
    }

    /// Next keystream word
    #[inline]
    pub fn next_key(&mut self) -> u32 {
        if self.remaining == 0 {
            self.refill();
        }
        self.remaining -= 1;
        self.results[self.remaining]
    }

    /// Encrypt in place by adding one keystream byte per data byte
    pub fn encrypt(&mut self, data: &mut [u8]) {
        for byte in data {
            *byte = byte.wrapping_add(self.next_key() as u8);
        }
    }

    /// Decrypt in place, reversing `encrypt` for an identically seeded generator
    pub fn decrypt(&mut self, data: &mut [u8]) {
        for byte in data {
            *byte = byte.wrapping_sub(self.next_key() as u8);
        }
    }

    #[inline]
    pub fn encrypt_byte(&mut self, byte: u8) -> u8 {
        byte.wrapping_add(self.next_key() as u8)
    }

    #[inline]
    pub fn decrypt_byte(&mut self, byte: u8) -> u8 {
        byte.wrapping_sub(self.next_key() as u8)
    }
}

impl fmt::Debug for Isaac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Isaac")
            .field("remaining", &self.remaining)
            .field("cc", &self.cc)
            .finish_non_exhaustive()
    }
}

/// One round of the ISAAC initialisation mix over its eight working words
#[inline]
fn scramble(s: &mut [u32; 8]) {
    const SHIFTS: [(bool, u32); 8] = [
        (true, 11),
        (false, 2),
        (true, 8),
        (false, 16),
        (true, 10),
        (false, 4),
        (true, 8),
        (false, 9),
    ];
    for (i, &(left, amount)) in SHIFTS.iter().enumerate() {
        let next = s[(i + 1) % 8];
        if left {
            s[i] ^= next << amount;
        } else {
            s[i] ^= next >> amount;
        }
        s[(i + 3) % 8] = s[(i + 3) % 8].wrapping_add(s[i]);
        s[(i + 1) % 8] = s[(i + 1) % 8].wrapping_add(s[(i + 2) % 8]);
    }
}

/// The 64-bit key pair exchanged during login
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKeys {
    pub client: u64,
    pub server: u64,
}

impl SessionKeys {
    pub fn new(client: u64, server: u64) -> Self {
        Self { client, server }
    }

    /// Seed words in wire order: client high, client low, server high, server low
    pub fn seeds(&self) -> [u32; 4] {
        [
            (self.client >> 32) as u32,
            self.client as u32,
            (self.server >> 32) as u32,
            self.server as u32,
        ]
    }
}

fn offset_seeds(seeds: [u32; 4]) -> [u32; 4] {
    seeds.map(|word| word.wrapping_add(ENCODER_SEED_OFFSET))
}

/// The two directional generators of one session
#[derive(Clone)]
pub struct CipherPair {
    /// Encrypts outgoing frames
    pub encoder: Isaac,
    /// Decrypts incoming frames
    pub decoder: Isaac,
}

impl CipherPair {
    /// Server side: decode with the raw seeds, encode with the offset seeds
    pub fn for_server(keys: SessionKeys) -> Self {
        let seeds = keys.seeds();
        Self {
            encoder: Isaac::new(&offset_seeds(seeds)),
            decoder: Isaac::new(&seeds),
        }
    }

    /// Client side mirror of `for_server`, used by tools and tests
    pub fn for_client(keys: SessionKeys) -> Self {
        let seeds = keys.seeds();
        Self {
            encoder: Isaac::new(&seeds),
            decoder: Isaac::new(&offset_seeds(seeds)),
        }
    }

    /// Split into (encoder, decoder) so each can move to its own task
    pub fn split(self) -> (Isaac, Isaac) {
        (self.encoder, self.decoder)
    }
}

impl fmt::Debug for CipherPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherPair")
            .field("encoder", &self.encoder)
            .field("decoder", &self.decoder)
            .finish()
    }
}
