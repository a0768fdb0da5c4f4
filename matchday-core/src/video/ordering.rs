use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use super::{PartIdentifier, VideoFile};

pub const PART_ORDER: [PartIdentifier; 7] = [
    PartIdentifier::PreMatch,
    PartIdentifier::FirstHalf,
    PartIdentifier::SecondHalf,
    PartIdentifier::ExtraTime,
    PartIdentifier::TrophyCeremony,
    PartIdentifier::PostMatch,
    PartIdentifier::Default,
];

/// Anything that occupies one part slot of a recording.
pub trait PartOrdered {
    fn part(&self) -> PartIdentifier;
    fn created_at(&self) -> DateTime<Utc>;
    /// Final tie breaker so equal (part, created_at) pairs sort stably.
    fn ordering_id(&self) -> Uuid;
}

impl PartOrdered for VideoFile {
    fn part(&self) -> PartIdentifier {
        self.part
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn ordering_id(&self) -> Uuid {
        self.id
    }
}

/// Canonical concatenation order for `items`.
///
/// Items are sorted by part; when two items claim the same part the one
/// created first is kept and the others are dropped. The result does not
/// depend on the order `items` arrives in.
pub fn concat_order<'a, T, I>(items: I) -> Vec<&'a T>
where
    T: PartOrdered + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut sorted: Vec<&T> = items.into_iter().collect();
    sorted.sort_by(|a, b| {
        a.part()
            .cmp(&b.part())
            .then_with(|| a.created_at().cmp(&b.created_at()))
            .then_with(|| a.ordering_id().cmp(&b.ordering_id()))
    });

    let mut seen = HashSet::new();
    sorted.retain(|item| {
        if seen.insert(item.part()) {
            true
        } else {
            warn!(part = %item.part(), id = %item.ordering_id(), "dropping duplicate part from concat list");
            false
        }
    });
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use url::Url;

    fn file(part: PartIdentifier) -> VideoFile {
        VideoFile::new(
            part,
            Url::parse(&format!("https://host.example/{}", part.as_str())).unwrap(),
        )
    }

    #[test]
    fn part_order_matches_enum_order() {
        let mut sorted = PART_ORDER;
        sorted.sort();
        assert_eq!(sorted, PART_ORDER);
    }

    #[test]
    fn order_is_independent_of_input_order() {
        let files: Vec<VideoFile> = PART_ORDER.iter().map(|part| file(*part)).collect();
        let expected: Vec<_> = concat_order(&files).iter().map(|f| f.id).collect();
        assert_eq!(expected.len(), PART_ORDER.len());

        let mut shuffled: Vec<&VideoFile> = files.iter().collect();
        for round in 0..20 {
            // Deterministic permutation: rotate then reverse on odd rounds.
            let len = shuffled.len();
            shuffled.rotate_left(round % len + 1);
            if round % 2 == 1 {
                shuffled.reverse();
            }
            let ordered: Vec<_> = concat_order(shuffled.iter().copied())
                .iter()
                .map(|f| f.id)
                .collect();
            assert_eq!(ordered, expected, "round {round}");
        }
    }

    #[test]
    fn earliest_created_wins_on_duplicate_part() {
        let early = file(PartIdentifier::FirstHalf);
        let mut late = file(PartIdentifier::FirstHalf);
        late.created_at = early.created_at + Duration::minutes(1);
        let second = file(PartIdentifier::SecondHalf);

        let ordered = concat_order([&second, &late, &early]);
        let ids: Vec<_> = ordered.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![early.id, second.id]);
    }
}
