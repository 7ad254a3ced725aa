// THEORY:
// The `EnsembleScorer` turns the independent, often disagreeing classifier
// outputs for one slot region into a single per-frame decision. It is stateless:
// everything it needs (the region, the slot's reference and previous snapshots)
// is handed in, and it returns one `EnsembleScore`.
//
// Scoring runs in two phases:
// 1.  **Gates.** Rapid motion, a large skin-tone fraction and a hard shadow each
//     short-circuit the vote and force the slot vacant for this frame. The gate
//     that fired is reported so the temporal layer can tell a hand passing
//     through (transient, not evidence) from a shadow (genuine evidence of an
//     empty slot).
// 2.  **Weighted vote.** The remaining classifiers vote with fixed weights. The
//     occupied side must beat the vacant side by a margin, which biases ambiguous
//     frames towards vacant. Confidence is the weighted mean classifier
//     confidence scaled by how much of the total weight agreed with the result.

use crate::config::EnsembleConfig;
use crate::core_modules::classifiers::{self, ClassifierOutcome};
use crate::core_modules::region::Region;
use crate::error::Result;
use log::debug;

const MOTION_GATE_CONFIDENCE: f64 = 0.8;
const SKIN_GATE_CONFIDENCE: f64 = 0.75;
const SHADOW_GATE_CONFIDENCE: f64 = 0.85;
const PARTIAL_SKIN_CONFIDENCE: f64 = 0.6;

/// Which short-circuit rule decided a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    RapidMotion,
    SkinTone,
    Shadow,
}

impl Gate {
    /// Transient gates describe something passing through the slot, not the
    /// slot's contents.
    pub fn is_transient(&self) -> bool {
        matches!(self, Gate::RapidMotion | Gate::SkinTone)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnsembleScore {
    pub occupied: bool,
    pub confidence: f64,
    pub shadow: bool,
    /// Set when a gate short-circuited the vote.
    pub gate: Option<Gate>,
}

impl EnsembleScore {
    fn gated(gate: Gate, confidence: f64) -> Self {
        EnsembleScore {
            occupied: false,
            confidence,
            shadow: gate == Gate::Shadow,
            gate: Some(gate),
        }
    }
}

/// One weighted vote.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ballot {
    pub occupied: bool,
    pub confidence: f64,
    pub weight: f64,
}

/// Tallies ballots. Returns `(occupied, confidence)`, or `None` when there is
/// nothing to tally.
pub fn tally(ballots: &[Ballot], margin: f64) -> Option<(bool, f64)> {
    let (mut occupied_weight, mut vacant_weight, mut weighted_confidence) = (0.0, 0.0, 0.0);
    for ballot in ballots {
        if ballot.occupied {
            occupied_weight += ballot.weight;
        } else {
            vacant_weight += ballot.weight;
        }
        weighted_confidence += ballot.confidence * ballot.weight;
    }
    let total = occupied_weight + vacant_weight;
    if total <= 0.0 {
        return None;
    }
    let occupied = occupied_weight > vacant_weight * margin;
    let winning = if occupied {
        occupied_weight
    } else {
        vacant_weight
    };
    let confidence = (weighted_confidence / total) * (winning / total);
    Some((occupied, confidence.clamp(0.0, 1.0)))
}

#[derive(Debug, Clone, Default)]
pub struct EnsembleScorer {
    config: EnsembleConfig,
}

impl EnsembleScorer {
    pub fn new(config: EnsembleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Scores one slot region. `Ok(None)` means no classifier could say
    /// anything about it and the frame carries no new evidence.
    pub fn score(
        &self,
        region: &Region,
        reference: Option<&Region>,
        previous: Option<&Region>,
    ) -> Result<Option<EnsembleScore>> {
        if region.is_empty() {
            return Ok(None);
        }

        if let Some(motion) = classifiers::rapid_motion(region, previous)? {
            if motion.is_rapid {
                debug!(
                    "motion gate: mean diff {:.1}, changed {:.2}",
                    motion.mean_diff, motion.changed_fraction
                );
                return Ok(Some(EnsembleScore::gated(Gate::RapidMotion, MOTION_GATE_CONFIDENCE)));
            }
        }

        let skin = classifiers::skin_tone(region)?;
        if skin.fraction > self.config.skin_gate_fraction {
            debug!("skin gate: fraction {:.2}", skin.fraction);
            return Ok(Some(EnsembleScore::gated(Gate::SkinTone, SKIN_GATE_CONFIDENCE)));
        }

        let shadow = classifiers::shadow(region, reference)?;
        if shadow.is_shadow && shadow.confidence > self.config.shadow_hard_threshold {
            debug!("shadow gate: {} indicators", shadow.indicators);
            return Ok(Some(EnsembleScore::gated(Gate::Shadow, SHADOW_GATE_CONFIDENCE)));
        }

        let mut ballots = Vec::with_capacity(5);
        if skin.present {
            ballots.push(Ballot {
                occupied: false,
                confidence: PARTIAL_SKIN_CONFIDENCE,
                weight: self.config.partial_skin_weight,
            });
        }
        if shadow.confidence > self.config.shadow_soft_threshold {
            ballots.push(Ballot {
                occupied: false,
                confidence: shadow.confidence,
                weight: self.config.soft_shadow_weight,
            });
        }
        let voters = [
            (classifiers::color(region)?, self.config.color_weight),
            (classifiers::texture(region)?, self.config.texture_weight),
            (
                classifiers::difference(region, reference)?,
                self.config.difference_weight,
            ),
        ];
        for (outcome, weight) in voters {
            if let ClassifierOutcome::Vote {
                occupied,
                confidence,
            } = outcome
            {
                ballots.push(Ballot {
                    occupied,
                    confidence,
                    weight,
                });
            }
        }

        Ok(tally(&ballots, self.config.decision_margin).map(|(occupied, confidence)| {
            EnsembleScore {
                occupied,
                confidence,
                shadow: shadow.is_shadow,
                gate: None,
            }
        }))
    }
}
