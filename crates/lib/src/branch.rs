//! Version (branch) names: `<distribution>.<major>.<minor>.<YYYYMMDD>`.
//!
//! Versions are ordered newest first: a higher major wins, then a higher
//! minor. The date field only decides how the next name is derived: a
//! commit on the same day bumps the minor, a commit on a later day bumps
//! the major and resets the minor.

use std::cmp::Ordering;
use std::fmt::Display;
use std::str::FromStr;

use anyhow::Result;
use chrono::NaiveDate;

use crate::error::Error;

/// Format of the date field.
const DATE_FORMAT: &str = "%Y%m%d";

/// A parsed branch name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchName {
    distribution: String,
    major: u64,
    minor: u64,
    date: String,
}

impl FromStr for BranchName {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || Error::InvalidBranch(s.to_owned());
        let fields: Vec<&str> = s.split('.').collect();
        let [distribution, major, minor, date] = fields.as_slice() else {
            return Err(invalid());
        };
        Ok(Self {
            distribution: (*distribution).to_owned(),
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
            date: (*date).to_owned(),
        })
    }
}

impl Display for BranchName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.distribution, self.major, self.minor, self.date
        )
    }
}

impl BranchName {
    /// The first version of a distribution, dated `today`.
    pub fn initial(distribution: &str, today: NaiveDate) -> Self {
        Self {
            distribution: distribution.to_owned(),
            major: 0,
            minor: 0,
            date: today.format(DATE_FORMAT).to_string(),
        }
    }

    /// The version that follows this one when committing on `today`.
    pub fn next(&self, today: NaiveDate) -> Self {
        let today = today.format(DATE_FORMAT).to_string();
        let mut r = self.clone();
        if r.date == today {
            r.minor += 1;
        } else {
            r.major += 1;
            r.minor = 0;
            r.date = today;
        }
        r
    }

    /// The distribution field.
    pub fn distribution(&self) -> &str {
        &self.distribution
    }
}

/// Whether `name` has exactly four dot-separated fields with integer
/// major and minor.
pub fn is_valid(name: &str) -> bool {
    name.parse::<BranchName>().is_ok()
}

/// Today's date in local time.
pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// Compute the successor of `name` for a commit made `today`.
pub fn increment(name: &str, today: NaiveDate) -> Result<String> {
    let b: BranchName = name.parse()?;
    Ok(b.next(today).to_string())
}

/// The first version name for `distribution`.
pub fn gen_init_name(distribution: &str, today: NaiveDate) -> String {
    BranchName::initial(distribution, today).to_string()
}

/// Newest-first comparator. Both names must be valid; filter with
/// [`is_valid`] before sorting (see [`sort_newest_first`]).
pub fn compare(a: &str, b: &str) -> Ordering {
    let key = |s: &str| {
        let mut it = s.split('.').skip(1);
        let major = it.next().and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        let minor = it.next().and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        (major, minor)
    };
    key(b).cmp(&key(a))
}

/// Drop invalid names, then sort newest first.
pub fn sort_newest_first<S: AsRef<str>>(names: impl IntoIterator<Item = S>) -> Vec<String> {
    let mut r: Vec<String> = names
        .into_iter()
        .filter(|n| {
            let valid = is_valid(n.as_ref());
            if !valid {
                tracing::debug!("Ignoring invalid branch name {}", n.as_ref());
            }
            valid
        })
        .map(|n| n.as_ref().to_owned())
        .collect();
    r.sort_by(|a, b| compare(a, b));
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_valid() {
        assert!(is_valid("deepin.0.0.20230501"));
        assert!(is_valid("d.12.3.anything"));
        for v in ["", "deepin", "deepin.1.2", "deepin.a.2.20230501", "d.1.2.3.4", "d.1.-2.x"] {
            assert!(!is_valid(v), "{v}");
        }
    }

    #[test]
    fn test_increment() {
        let v = increment("dist.1.2.20230101", date(2023, 1, 2)).unwrap();
        assert_eq!(v, "dist.2.0.20230102");
        let v = increment(&v, date(2023, 1, 2)).unwrap();
        assert_eq!(v, "dist.2.1.20230102");
        let e = increment("dist.x.2.20230101", date(2023, 1, 2)).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<Error>(),
            Some(Error::InvalidBranch(_))
        ));
    }

    #[test]
    fn test_increment_result_is_newer() {
        let a = "d.4.7.20230101";
        for today in [date(2023, 1, 1), date(2024, 2, 29)] {
            let b = increment(a, today).unwrap();
            assert!(is_valid(&b));
            assert_eq!(compare(&b, a), Ordering::Less);
        }
    }

    #[test]
    fn test_gen_init_name() {
        assert_eq!(gen_init_name("deepin", date(2023, 5, 1)), "deepin.0.0.20230501");
    }

    #[test]
    fn test_sort() {
        let v = sort_newest_first([
            "d.1.0.20230101",
            "d.2.0.20230101",
            "bogus",
            "d.1.5.20230101",
        ]);
        assert_eq!(v, ["d.2.0.20230101", "d.1.5.20230101", "d.1.0.20230101"]);
    }
}
