//! Provider transaction snapshots, in `txid_current_snapshot()` text form.

use crate::ParseError;

/// Parsed `xmin:xmax:xip,...` snapshot.
///
/// Used to decide whether a replayed event was already visible to the
/// initial copy of a table and therefore must be skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub xmin: i64,
    pub xmax: i64,
    pub xip: Vec<i64>,
}

impl Snapshot {
    pub fn parse(s: &str) -> Result<Snapshot, ParseError> {
        let bad = || ParseError::Snapshot(s.to_owned());
        let mut parts = s.trim().splitn(3, ':');
        let xmin = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let xmax = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let mut xip = Vec::new();
        if let Some(rest) = parts.next() {
            for part in rest.split(',') {
                if part.is_empty() {
                    continue;
                }
                xip.push(part.parse().map_err(|_| bad())?);
            }
        }
        Ok(Snapshot { xmin, xmax, xip })
    }

    /// Was `txid` already committed and visible when the snapshot was taken?
    pub fn contains(&self, txid: i64) -> bool {
        if txid < self.xmin {
            return true;
        }
        if txid >= self.xmax {
            return false;
        }
        !self.xip.contains(&txid)
    }
}

impl std::str::FromStr for Snapshot {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Snapshot::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility() {
        let snap = Snapshot::parse("10:20:12,15").unwrap();
        assert!(snap.contains(5));
        assert!(snap.contains(11));
        assert!(!snap.contains(12), "in-progress txid is not visible");
        assert!(!snap.contains(15));
        assert!(!snap.contains(20));
        assert!(!snap.contains(100));
    }

    #[test]
    fn empty_xip() {
        let snap = Snapshot::parse("100:100:").unwrap();
        assert_eq!(snap.xip, Vec::<i64>::new());
        assert!(snap.contains(99));
        assert!(!snap.contains(100));
    }

    #[test]
    fn bad_input() {
        assert!(Snapshot::parse("").is_err());
        assert!(Snapshot::parse("1:x:").is_err());
        assert!(Snapshot::parse("1").is_err());
    }
}
