use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// Decides when the daily digest is due.
///
/// Fires at most once per local date, on the first check at or after the
/// configured time. A clock started after that time on a given day waits
/// for the next day.
#[derive(Debug, Clone)]
pub struct DigestClock {
    at: NaiveTime,
    last_fired: Option<NaiveDate>,
}

impl DigestClock {
    pub fn new(at: NaiveTime, started: NaiveDateTime) -> Self {
        let last_fired = (started.time() >= at).then(|| started.date());
        Self { at, last_fired }
    }

    /// The date whose digest is due at `now`, if any.
    pub fn due(&self, now: NaiveDateTime) -> Option<NaiveDate> {
        let today = now.date();
        let fired_today = self.last_fired.map_or(false, |d| d >= today);
        (!fired_today && now.time() >= self.at).then_some(today)
    }

    pub fn mark_fired(&mut self, day: NaiveDate) {
        self.last_fired = Some(self.last_fired.map_or(day, |d| d.max(day)));
    }

    pub fn last_fired(&self) -> Option<NaiveDate> {
        self.last_fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn nine_pm() -> NaiveTime {
        NaiveTime::from_hms_opt(21, 0, 0).unwrap()
    }

    #[test]
    fn test_due_once_per_day() {
        let mut clock = DigestClock::new(nine_pm(), at(18, 8, 0));
        assert_eq!(clock.due(at(18, 20, 59)), None);

        let due = clock.due(at(18, 21, 0)).unwrap();
        assert_eq!(due, at(18, 0, 0).date());
        clock.mark_fired(due);

        assert_eq!(clock.due(at(18, 21, 1)), None);
        assert_eq!(clock.due(at(18, 23, 59)), None);
        assert_eq!(clock.due(at(19, 9, 0)), None);
        assert_eq!(clock.due(at(19, 21, 30)), Some(at(19, 0, 0).date()));
    }

    #[test]
    fn test_started_after_digest_time_waits_for_next_day() {
        let clock = DigestClock::new(nine_pm(), at(18, 22, 15));
        assert_eq!(clock.due(at(18, 23, 0)), None);
        assert_eq!(clock.due(at(19, 21, 0)), Some(at(19, 0, 0).date()));
    }

    #[test]
    fn test_missed_day_fires_on_next_check() {
        let mut clock = DigestClock::new(nine_pm(), at(18, 8, 0));
        clock.mark_fired(at(18, 0, 0).date());
        // Process was suspended through the 19th.
        assert_eq!(clock.due(at(20, 21, 5)), Some(at(20, 0, 0).date()));
    }

    #[test]
    fn test_mark_fired_never_moves_backwards() {
        let mut clock = DigestClock::new(nine_pm(), at(18, 8, 0));
        clock.mark_fired(at(19, 0, 0).date());
        clock.mark_fired(at(18, 0, 0).date());
        assert_eq!(clock.last_fired(), Some(at(19, 0, 0).date()));
    }
}
