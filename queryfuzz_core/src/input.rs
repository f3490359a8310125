use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::VecDeque;
use std::path::Path;

/// Supplies input buffers to the driver, one per iteration.
///
/// `Some(Some(bytes))` is an input, `Some(None)` is the absent-input sentinel
/// (distinct from an empty buffer), and `None` means the source is exhausted.
pub trait InputSource {
    /// Short label used in log lines.
    fn name(&self) -> &'static str;

    /// Produces the next iteration's input.
    ///
    /// # Returns
    /// * `Some(Some(bytes))`: an input to run, possibly empty.
    /// * `Some(None)`: the absent-input sentinel; the iteration is counted as
    ///   null and never reaches the engine.
    /// * `None`: the source is exhausted and the session ends.
    fn next_input(&mut self) -> Option<Option<Vec<u8>>>;
}

/// Uniformly random buffers of bounded length from a seeded ChaCha8 stream.
pub struct RandomBytesSource {
    rng: ChaCha8Rng,
    max_len: usize,
    only_ascii: bool,
}

impl RandomBytesSource {
    pub fn new(seed: u64, max_len: usize, only_ascii: bool) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            max_len,
            only_ascii,
        }
    }
}

impl InputSource for RandomBytesSource {
    fn name(&self) -> &'static str {
        "RandomBytesSource"
    }

    fn next_input(&mut self) -> Option<Option<Vec<u8>>> {
        let len = self.rng.random_range(0..=self.max_len);
        let bytes = (0..len)
            .map(|_| {
                if self.only_ascii {
                    self.rng.random_range(0x20u8..0x7f)
                } else {
                    self.rng.random::<u8>()
                }
            })
            .collect();
        Some(Some(bytes))
    }
}

/// Replays every regular file of a directory once, in file-name order.
#[derive(Debug, Clone)]
pub struct SeedReplaySource {
    seeds: VecDeque<Vec<u8>>,
}

impl SeedReplaySource {
    pub fn from_dir(dir: &Path) -> std::io::Result<Self> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        let seeds = paths
            .iter()
            .map(std::fs::read)
            .collect::<std::io::Result<VecDeque<_>>>()?;
        Ok(Self { seeds })
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }
}

impl InputSource for SeedReplaySource {
    fn name(&self) -> &'static str {
        "SeedReplaySource"
    }

    fn next_input(&mut self) -> Option<Option<Vec<u8>>> {
        self.seeds.pop_front().map(Some)
    }
}

/// A fixed list of inputs, absent-input sentinels included.
#[derive(Debug, Default, Clone)]
pub struct VecSource {
    inputs: VecDeque<Option<Vec<u8>>>,
}

impl VecSource {
    pub fn new(inputs: impl IntoIterator<Item = Option<Vec<u8>>>) -> Self {
        Self {
            inputs: inputs.into_iter().collect(),
        }
    }
}

impl InputSource for VecSource {
    fn name(&self) -> &'static str {
        "VecSource"
    }

    fn next_input(&mut self) -> Option<Option<Vec<u8>>> {
        self.inputs.pop_front()
    }
}
