use chrono::{DateTime, Local, NaiveDate, Utc};

/// Source of "now" for TTL and retention checks.
///
/// Expiry instants are UTC; calendar dates (retention window, "today") are
/// the date on the wall calendar of the machine running the store.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;

  fn today(&self) -> NaiveDate {
    self.now().date_naive()
  }
}

/// Wall clock in the local timezone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }

  fn today(&self) -> NaiveDate {
    Local::now().date_naive()
  }
}

/// Clock that only moves when told to.
///
/// `offset` shifts the calendar date the way a local timezone would.
#[cfg(test)]
pub struct ManualClock {
  now: std::sync::Mutex<DateTime<Utc>>,
  offset: std::sync::Mutex<chrono::FixedOffset>,
}

#[cfg(test)]
impl ManualClock {
  pub fn new(now: DateTime<Utc>) -> Self {
    Self {
      now: std::sync::Mutex::new(now),
      offset: std::sync::Mutex::new(chrono::FixedOffset::east_opt(0).unwrap()),
    }
  }

  /// Same instant, calendar dates read `hours` east of UTC.
  pub fn with_utc_offset(self, hours: i32) -> Self {
    *self.offset.lock().unwrap() = chrono::FixedOffset::east_opt(hours * 3600).unwrap();
    self
  }

  /// Fixed noon-UTC clock on the given day.
  pub fn at_date(y: i32, m: u32, d: u32) -> Self {
    use chrono::TimeZone;
    Self::new(Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap())
  }

  pub fn set(&self, now: DateTime<Utc>) {
    *self.now.lock().unwrap() = now;
  }

  pub fn advance(&self, by: chrono::Duration) {
    let mut now = self.now.lock().unwrap();
    *now += by;
  }
}

#[cfg(test)]
impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap()
  }

  fn today(&self) -> NaiveDate {
    let offset = *self.offset.lock().unwrap();
    self.now().with_timezone(&offset).date_naive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn calendar_date_follows_local_offset() {
    // 07:00 on the 16th in UTC+8 is still the 15th in UTC
    let instant = Utc.with_ymd_and_hms(2024, 1, 15, 23, 0, 0).unwrap();
    let clock = ManualClock::new(instant).with_utc_offset(8);

    assert_eq!(clock.now().date_naive(), NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
    assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 1, 16).unwrap());
  }

  #[test]
  fn system_clock_today_is_local_date() {
    assert_eq!(SystemClock.today(), Local::now().date_naive());
  }
}
