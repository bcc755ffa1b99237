//! Reserve-capacity sizing
//!
//! Computes how a member's reserve chain must change to reach a declared
//! percentage of its base volume. Growth appends one member sized to the
//! difference. Shrinking removes whole members from the tail; when the
//! removed members overshoot, the difference is expanded back. The head
//! member is never removed.

use serde::Serialize;

use snapcg_core::{bytes_for_percent, percent_of, Result, SnapError};

/// One member of a reserve chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainMember {
    pub id: String,
    pub size: u64,
}

/// Change needed to reach the declared percentage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resize {
    Unchanged,
    Expand {
        percent: u32,
        bytes: u64,
    },
    Trim {
        /// Members removed from the tail
        trim_count: usize,
        /// Percentage the removed members account for
        trimmed_pct: u32,
        /// Expansion that follows the trim to correct overshoot
        compensate_pct: u32,
    },
}

/// Inputs for one base volume
#[derive(Debug, Clone)]
pub struct SizingInput<'a> {
    pub volume: &'a str,
    pub base_bytes: u64,
    pub current_pct: u32,
    pub declared_pct: u32,
    /// Size of the head member
    pub head_bytes: u64,
    /// Members that may be trimmed, tail first
    pub trimmable: &'a [ChainMember],
    /// Any snapshot image references the base volume
    pub has_images: bool,
}

/// Plan the resize of one reserve chain
pub fn plan_resize(input: &SizingInput<'_>) -> Result<Resize> {
    if input.declared_pct == input.current_pct {
        return Ok(Resize::Unchanged);
    }

    if input.declared_pct > input.current_pct {
        let percent = input.declared_pct - input.current_pct;
        return Ok(Resize::Expand {
            percent,
            bytes: bytes_for_percent(percent, input.base_bytes),
        });
    }

    if input.has_images {
        return Err(SnapError::TrimBlockedByImages {
            volume: input.volume.to_string(),
        });
    }

    let total = input.head_bytes + input.trimmable.iter().map(|m| m.size).sum::<u64>();
    let mut accumulated = 0u64;
    for (index, member) in input.trimmable.iter().enumerate() {
        accumulated += member.size;
        let kept = total.saturating_sub(accumulated);
        if percent_of(kept, input.base_bytes) <= input.declared_pct {
            return Ok(Resize::Trim {
                trim_count: index + 1,
                trimmed_pct: percent_of(accumulated, input.base_bytes),
                compensate_pct: compensation(kept, input.base_bytes, input.declared_pct),
            });
        }
    }

    Err(SnapError::HeadMemberProtected {
        volume: input.volume.to_string(),
        minimum_pct: percent_of(input.head_bytes, input.base_bytes),
    })
}

/// Smallest whole percentage that brings `kept` bytes up to `declared_pct`
fn compensation(kept: u64, base_bytes: u64, declared_pct: u32) -> u32 {
    let mut pct = declared_pct.saturating_sub(percent_of(kept, base_bytes));
    while pct < declared_pct
        && percent_of(kept + bytes_for_percent(pct, base_bytes), base_bytes) < declared_pct
    {
        pct += 1;
    }
    pct
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    /// Trimmable members, tail first, of a head-first chain
    fn tail_first(sizes: &[u64]) -> Vec<ChainMember> {
        sizes
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .map(|(i, size)| ChainMember {
                id: format!("m{}", i),
                size: *size,
            })
            .collect()
    }

    fn plan(sizes: &[u64], base: u64, current: u32, declared: u32, has_images: bool) -> Result<Resize> {
        let trimmable = tail_first(sizes);
        plan_resize(&SizingInput {
            volume: "vol1",
            base_bytes: base,
            current_pct: current,
            declared_pct: declared,
            head_bytes: sizes[0],
            trimmable: &trimmable,
            has_images,
        })
    }

    #[test]
    fn test_unchanged() {
        assert_eq!(plan(&[20 * GIB], 100 * GIB, 20, 20, true).unwrap(), Resize::Unchanged);
    }

    #[test]
    fn test_expand_by_delta() {
        assert_eq!(
            plan(&[20 * GIB], 100 * GIB, 20, 35, true).unwrap(),
            Resize::Expand {
                percent: 15,
                bytes: 15 * GIB
            }
        );
    }

    #[test]
    fn test_trim_exact() {
        assert_eq!(
            plan(&[20 * GIB, 10 * GIB, 5 * GIB], 100 * GIB, 35, 20, false).unwrap(),
            Resize::Trim {
                trim_count: 2,
                trimmed_pct: 15,
                compensate_pct: 0
            }
        );
    }

    #[test]
    fn test_trim_overshoot_compensates() {
        assert_eq!(
            plan(&[20 * GIB, 10 * GIB], 100 * GIB, 30, 25, false).unwrap(),
            Resize::Trim {
                trim_count: 1,
                trimmed_pct: 10,
                compensate_pct: 5
            }
        );
    }

    #[test]
    fn test_compensation_uses_kept_bytes() {
        // 10.4% kept after the trim; rounding the removed share alone lands on 10%
        assert_eq!(
            plan(&[104, 104], 1000, 21, 11, false).unwrap(),
            Resize::Trim {
                trim_count: 1,
                trimmed_pct: 10,
                compensate_pct: 1
            }
        );
        assert_eq!(percent_of(104 + bytes_for_percent(1, 1000), 1000), 11);
    }

    #[test]
    fn test_trim_blocked_by_images() {
        let err = plan(&[20 * GIB, 10 * GIB], 100 * GIB, 30, 20, true).unwrap_err();
        assert!(matches!(err, SnapError::TrimBlockedByImages { .. }));
    }

    #[test]
    fn test_head_member_protected() {
        let err = plan(&[20 * GIB, 10 * GIB], 100 * GIB, 30, 10, false).unwrap_err();
        assert_eq!(
            err,
            SnapError::HeadMemberProtected {
                volume: "vol1".to_string(),
                minimum_pct: 20
            }
        );
    }

    proptest! {
        #[test]
        fn prop_trim_then_expand_reaches_declared(
            unit in 10u64..(1u64 << 30),
            shares in prop::collection::vec(1u64..3_000, 1..6),
            cut in 1u32..100,
        ) {
            // Member sizes in arbitrary bytes, up to 30% of the base each
            let base = 100 * unit;
            let sizes: Vec<u64> = shares.iter().map(|s| s * unit / 100).filter(|s| *s > 0).collect();
            prop_assume!(!sizes.is_empty());
            let total: u64 = sizes.iter().sum();
            let current = percent_of(total, base);
            prop_assume!(cut < current);
            let declared = current - cut;

            match plan(&sizes, base, current, declared, false) {
                Ok(Resize::Trim { trim_count, compensate_pct, .. }) => {
                    prop_assert!(trim_count < sizes.len());
                    let kept: u64 = sizes[..sizes.len() - trim_count].iter().sum();
                    let final_bytes = kept + bytes_for_percent(compensate_pct, base);
                    prop_assert_eq!(percent_of(final_bytes, base), declared);
                }
                Err(SnapError::HeadMemberProtected { minimum_pct, .. }) => {
                    prop_assert_eq!(minimum_pct, percent_of(sizes[0], base));
                    prop_assert!(declared < minimum_pct);
                }
                other => prop_assert!(false, "unexpected plan {:?}", other),
            }
        }
    }
}
