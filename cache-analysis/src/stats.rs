use core::fmt;

use crate::Category;

/// Counts the accesses of each category produced by a categorization run
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CategoryStats {
    always_hit: usize,
    always_miss: usize,
    first_miss: usize,
    not_classified: usize,
}

impl CategoryStats {
    pub fn record(&mut self, category: Category) {
        match category {
            Category::AlwaysHit => self.always_hit += 1,
            Category::AlwaysMiss => self.always_miss += 1,
            Category::FirstMiss => self.first_miss += 1,
            Category::NotClassified => self.not_classified += 1,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// The number of accesses categorized as `category`
    pub fn count(&self, category: Category) -> usize {
        match category {
            Category::AlwaysHit => self.always_hit,
            Category::AlwaysMiss => self.always_miss,
            Category::FirstMiss => self.first_miss,
            Category::NotClassified => self.not_classified,
        }
    }

    pub fn total(&self) -> usize {
        self.always_hit + self.always_miss + self.first_miss + self.not_classified
    }

    /// The share of the accesses categorized as `category`, as a whole percentage
    pub fn percent(&self, category: Category) -> usize {
        match self.total() {
            0 => 0,
            total => self.count(category) * 100 / total,
        }
    }
}

impl fmt::Display for CategoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "total = {}", self.total())?;
        if self.total() == 0 {
            return Ok(());
        }
        for category in Category::ALL {
            write!(
                f,
                "\n{category} = {} ({}%)",
                self.count(category),
                self.percent(category)
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn display_reports_percentages() {
        let mut stats = CategoryStats::default();
        assert_eq!(alloc::format!("{stats}"), "total = 0");

        stats.record(Category::AlwaysHit);
        stats.record(Category::AlwaysHit);
        stats.record(Category::FirstMiss);
        stats.record(Category::NotClassified);
        assert_eq!(stats.total(), 4);
        assert_eq!(
            alloc::format!("{stats}"),
            "total = 4\nAH = 2 (50%)\nAM = 0 (0%)\nFM = 1 (25%)\nNC = 1 (25%)"
        );

        stats.reset();
        assert_eq!(stats, CategoryStats::default());
    }
}
