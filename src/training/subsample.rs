use std::collections::{BTreeMap, HashSet};

use rand::prelude::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{SubsetStrategy, SubsetSize};
use crate::types::{Corpus, Subset, UtteranceId};

/// Candidate pool is limited to this many times the requested size when
/// short utterances are preferred.
const SHORT_POOL_FACTOR: usize = 10;

/// Deterministic per-stage corpus sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorpusSubsampler {
    strategy: SubsetStrategy,
    prefer_short: bool,
}

impl CorpusSubsampler {
    pub fn new(strategy: SubsetStrategy, prefer_short: bool) -> Self {
        Self {
            strategy,
            prefer_short,
        }
    }

    /// Selects a subset of `requested` utterances. Same corpus, size, seed and
    /// priority list always yield the same subset, returned in corpus order.
    ///
    /// `priority` ids are taken first (up to the requested size); unknown ids
    /// are ignored.
    pub fn select(
        &self,
        corpus: &Corpus,
        requested: SubsetSize,
        seed: u64,
        priority: &[UtteranceId],
    ) -> Subset {
        let total = corpus.len();
        let wanted = match requested {
            SubsetSize::Full => total,
            SubsetSize::Utterances(n) => n,
        };
        if wanted >= total {
            return Subset {
                requested,
                utterance_ids: corpus.utterances().iter().map(|u| u.id.clone()).collect(),
                is_full_corpus: true,
            };
        }

        let mut picked: Vec<usize> = priority
            .iter()
            .filter_map(|id| corpus.position(id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        picked.sort_unstable();
        picked.truncate(wanted);

        let remaining = wanted - picked.len();
        if remaining > 0 {
            let taken: HashSet<usize> = picked.iter().copied().collect();
            let mut pool: Vec<usize> = (0..total).filter(|pos| !taken.contains(pos)).collect();
            if self.prefer_short {
                restrict_to_shortest(corpus, &mut pool, remaining * SHORT_POOL_FACTOR);
            }
            let mut rng = StdRng::seed_from_u64(seed);
            let drawn = match self.strategy {
                SubsetStrategy::Uniform => {
                    pool.shuffle(&mut rng);
                    pool.truncate(remaining);
                    pool
                }
                SubsetStrategy::SpeakerBalanced => {
                    draw_speaker_balanced(corpus, &pool, remaining, &mut rng)
                }
            };
            picked.extend(drawn);
        }

        picked.sort_unstable();
        Subset {
            requested,
            utterance_ids: picked
                .into_iter()
                .map(|pos| corpus.utterances()[pos].id.clone())
                .collect(),
            is_full_corpus: false,
        }
    }
}

/// Keeps the `limit` shortest utterances when every duration is known.
fn restrict_to_shortest(corpus: &Corpus, pool: &mut Vec<usize>, limit: usize) {
    if limit >= pool.len() {
        return;
    }
    let utterances = corpus.utterances();
    if pool.iter().any(|&pos| utterances[pos].duration_ms.is_none()) {
        return;
    }
    pool.sort_by(|&a, &b| {
        let (ua, ub) = (&utterances[a], &utterances[b]);
        ua.duration_ms
            .cmp(&ub.duration_ms)
            .then_with(|| ua.id.cmp(&ub.id))
    });
    pool.truncate(limit);
    pool.sort_unstable();
}

/// Round-robin over shuffled speakers so small subsets still span many voices.
fn draw_speaker_balanced(
    corpus: &Corpus,
    pool: &[usize],
    count: usize,
    rng: &mut StdRng,
) -> Vec<usize> {
    let utterances = corpus.utterances();
    let mut by_speaker: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for &pos in pool {
        let utt = &utterances[pos];
        let speaker = utt.speaker.as_deref().unwrap_or(utt.id.as_str());
        by_speaker.entry(speaker).or_default().push(pos);
    }

    let mut queues: Vec<Vec<usize>> = by_speaker.into_values().collect();
    for queue in &mut queues {
        queue.shuffle(rng);
        // Popped from the back.
        queue.reverse();
    }
    queues.shuffle(rng);

    let mut drawn = Vec::with_capacity(count);
    while drawn.len() < count {
        let before = drawn.len();
        for queue in &mut queues {
            if drawn.len() == count {
                break;
            }
            if let Some(pos) = queue.pop() {
                drawn.push(pos);
            }
        }
        if drawn.len() == before {
            break;
        }
    }
    drawn
}
