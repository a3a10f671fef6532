//! Campaign definitions — ordered (offset, message key) drip sequences.
//!
//! A campaign is static configuration: the scheduler turns it into a batch
//! of absolute-time jobs at enrollment. Offsets are non-decreasing so an
//! enrollment batch always fires in definition order.

use chrono::Duration;

/// Campaign identifier for the gift drip sequence.
pub const GIFT_CAMPAIGN: &str = "gift";

/// One step of a drip campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignStep {
    /// Offset from the enrollment reference time.
    pub offset: Duration,
    /// Catalog key of the message body to push.
    pub message_key: &'static str,
}

/// A named, ordered drip sequence enrolled as a unit for one user.
#[derive(Debug, Clone)]
pub struct Campaign {
    pub id: &'static str,
    pub steps: Vec<CampaignStep>,
}

/// All campaigns known to the scheduler.
#[derive(Debug, Clone)]
pub struct CampaignRegistry {
    campaigns: Vec<Campaign>,
}

impl CampaignRegistry {
    /// Build the registry with production (day-scale) offsets, or the
    /// second-scale demo offsets used for manual end-to-end testing.
    pub fn new(demo_timings: bool) -> Self {
        let steps = if demo_timings {
            vec![
                step(Duration::seconds(30), "day1_reminder"),
                step(Duration::seconds(60), "day2_invite"),
                step(Duration::seconds(70), "day2_blessing"),
                step(Duration::seconds(90), "day3_teaser"),
                step(Duration::seconds(92), "rose_path"),
            ]
        } else {
            vec![
                step(Duration::hours(24), "day1_reminder"),
                step(Duration::hours(48), "day2_invite"),
                step(Duration::hours(48) + Duration::minutes(10), "day2_blessing"),
                step(Duration::hours(72), "day3_teaser"),
                step(Duration::hours(72) + Duration::minutes(10), "rose_path"),
            ]
        };

        Self {
            campaigns: vec![Campaign {
                id: GIFT_CAMPAIGN,
                steps,
            }],
        }
    }

    /// Resolve a campaign by id.
    pub fn get(&self, campaign_id: &str) -> Option<&Campaign> {
        self.campaigns.iter().find(|c| c.id == campaign_id)
    }
}

fn step(offset: Duration, message_key: &'static str) -> CampaignStep {
    CampaignStep {
        offset,
        message_key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gift_campaign_has_five_ordered_steps() {
        for demo in [false, true] {
            let registry = CampaignRegistry::new(demo);
            let gift = registry.get(GIFT_CAMPAIGN).unwrap();
            assert_eq!(gift.steps.len(), 5);
            for pair in gift.steps.windows(2) {
                assert!(pair[0].offset <= pair[1].offset, "offsets must not decrease");
            }
        }
    }

    #[test]
    fn production_offsets_match_schedule() {
        let registry = CampaignRegistry::new(false);
        let gift = registry.get(GIFT_CAMPAIGN).unwrap();
        let offsets: Vec<i64> = gift.steps.iter().map(|s| s.offset.num_minutes()).collect();
        assert_eq!(offsets, vec![24 * 60, 48 * 60, 48 * 60 + 10, 72 * 60, 72 * 60 + 10]);
        let keys: Vec<&str> = gift.steps.iter().map(|s| s.message_key).collect();
        assert_eq!(
            keys,
            vec!["day1_reminder", "day2_invite", "day2_blessing", "day3_teaser", "rose_path"]
        );
    }

    #[test]
    fn unknown_campaign_is_none() {
        let registry = CampaignRegistry::new(false);
        assert!(registry.get("does-not-exist").is_none());
    }
}
