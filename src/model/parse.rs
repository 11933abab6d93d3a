//! Parsers for the small operand grammars used in configuration:
//! durations (`90s`, `60m`, `24h`, `7d`, `2w`) and numeric comparisons (`>5`, `<=2`).

use std::time::Duration;

/// Parse a duration such as `90s`, `15m`, `24h`, `7d` or `2w`.
/// A bare number is taken as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
  let s = input.trim();
  if s.is_empty() {
    return Err("empty duration".to_string());
  }

  let split = s
    .find(|c: char| !c.is_ascii_digit())
    .unwrap_or(s.len());
  let (digits, unit) = s.split_at(split);

  let value: u64 = digits
    .parse()
    .map_err(|_| format!("invalid duration {input:?}"))?;

  let seconds_per_unit = match unit.trim() {
    "" | "s" | "sec" | "secs" => 1,
    "m" | "min" | "mins" => 60,
    "h" | "hr" | "hrs" => 60 * 60,
    "d" | "day" | "days" => 24 * 60 * 60,
    "w" | "wk" | "weeks" => 7 * 24 * 60 * 60,
    other => return Err(format!("unknown duration unit {other:?} in {input:?}")),
  };

  value
    .checked_mul(seconds_per_unit)
    .map(Duration::from_secs)
    .ok_or_else(|| format!("duration {input:?} is too large"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
  Greater,
  GreaterOrEqual,
  Less,
  LessOrEqual,
  Equal,
}

impl Comparison {
  /// Split a leading comparison operator off `input`. No operator means `=`.
  fn split(input: &str) -> (Comparison, &str) {
    let s = input.trim();
    for (prefix, cmp) in [
      (">=", Comparison::GreaterOrEqual),
      ("<=", Comparison::LessOrEqual),
      (">", Comparison::Greater),
      ("<", Comparison::Less),
      ("=", Comparison::Equal),
    ] {
      if let Some(rest) = s.strip_prefix(prefix) {
        return (cmp, rest.trim());
      }
    }
    (Comparison::Equal, s)
  }

  pub fn holds<T: PartialOrd>(&self, actual: T, expected: T) -> bool {
    match self {
      Comparison::Greater => actual > expected,
      Comparison::GreaterOrEqual => actual >= expected,
      Comparison::Less => actual < expected,
      Comparison::LessOrEqual => actual <= expected,
      Comparison::Equal => actual == expected,
    }
  }
}

/// A numeric threshold such as `>5` on a comment or reaction count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Threshold {
  pub cmp: Comparison,
  pub value: u32,
}

impl Threshold {
  pub fn parse(input: &str) -> Result<Self, String> {
    let (cmp, rest) = Comparison::split(input);
    let value = rest
      .parse()
      .map_err(|_| format!("invalid numeric threshold {input:?}"))?;
    Ok(Self { cmp, value })
  }

  pub fn matches(&self, actual: u32) -> bool {
    self.cmp.holds(actual, self.value)
  }
}

/// An age threshold such as `>30d` (older than 30 days) or `<2h` (younger than two hours).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgeThreshold {
  pub cmp: Comparison,
  pub age: chrono::Duration,
}

impl AgeThreshold {
  pub fn parse(input: &str) -> Result<Self, String> {
    let (cmp, rest) = Comparison::split(input);
    if cmp == Comparison::Equal {
      return Err(format!(
        "age threshold {input:?} needs a '>' or '<' comparison"
      ));
    }
    let age = parse_duration(rest)?;
    let age = chrono::Duration::from_std(age).map_err(|e| format!("{input:?}: {e}"))?;
    Ok(Self { cmp, age })
  }

  pub fn matches(&self, age: chrono::Duration) -> bool {
    self.cmp.holds(age, self.age)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_duration_units() {
    assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
    assert_eq!(parse_duration("60m").unwrap(), Duration::from_secs(3600));
    assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
    assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86400));
    assert_eq!(parse_duration("2w").unwrap(), Duration::from_secs(14 * 86400));
    assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
  }

  #[test]
  fn test_parse_duration_rejects_garbage() {
    assert!(parse_duration("").is_err());
    assert!(parse_duration("soon").is_err());
    assert!(parse_duration("5 fortnights").is_err());
  }

  #[test]
  fn test_threshold() {
    let t = Threshold::parse(">5").unwrap();
    assert!(t.matches(6));
    assert!(!t.matches(5));

    let t = Threshold::parse("<= 2").unwrap();
    assert!(t.matches(2));
    assert!(!t.matches(3));

    let t = Threshold::parse("3").unwrap();
    assert_eq!(t.cmp, Comparison::Equal);
    assert!(t.matches(3));

    assert!(Threshold::parse(">many").is_err());
  }

  #[test]
  fn test_age_threshold_requires_direction() {
    assert!(AgeThreshold::parse("30d").is_err());
    let t = AgeThreshold::parse(">30d").unwrap();
    assert!(t.matches(chrono::Duration::days(31)));
    assert!(!t.matches(chrono::Duration::days(29)));
  }
}
