use chrono::{Local, Timelike};
use rand::seq::SliceRandom;

const ANYTIME: &[&str] = &[
    "Hello, you've reached {name}",
    "Hi, this is {name}",
    "{name} speaking, how can I help?",
    "Hello, {name} here",
];

const MORNING: &[&str] = &[
    "Good morning, you've reached {name}",
    "Morning! This is {name}",
];

const AFTERNOON: &[&str] = &[
    "Good afternoon, this is {name}",
    "Good afternoon, you've reached {name}",
];

const EVENING: &[&str] = &[
    "Good evening, this is {name}",
    "Evening! You've reached {name}",
];

const NIGHT: &[&str] = &[
    "Hello, this is {name}, up late too?",
    "{name} here, even at this hour",
];

fn time_pool(hour: u32) -> &'static [&'static str] {
    match hour {
        5..=11 => MORNING,
        12..=16 => AFTERNOON,
        17..=20 => EVENING,
        _ => NIGHT,
    }
}

/// Select a greeting based on the current time of day.
///
/// Combines anytime greetings with time-specific ones and picks randomly.
/// The `{name}` placeholder is replaced with the provided name.
pub fn select_greeting(name: &str) -> String {
    let hour = Local::now().hour();
    select_greeting_for_hour(name, hour)
}

fn select_greeting_for_hour(name: &str, hour: u32) -> String {
    let time_specific = time_pool(hour);
    let mut pool: Vec<&str> = Vec::with_capacity(ANYTIME.len() + time_specific.len());
    pool.extend_from_slice(ANYTIME);
    pool.extend_from_slice(time_specific);

    let mut rng = rand::thread_rng();
    let template = pool.choose(&mut rng).unwrap_or(&ANYTIME[0]);
    template.replace("{name}", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_contains_name() {
        let greeting = select_greeting_for_hour("TestBot", 10);
        assert!(
            greeting.contains("TestBot"),
            "greeting should contain the configured name: {greeting}"
        );
    }

    #[test]
    fn greeting_no_placeholder_leftover() {
        for hour in 0..24 {
            let greeting = select_greeting_for_hour("Echo", hour);
            assert!(
                !greeting.contains("{name}"),
                "placeholder not replaced at hour {hour}: {greeting}"
            );
        }
    }

    #[test]
    fn greeting_never_empty() {
        for hour in 0..24 {
            let greeting = select_greeting_for_hour("X", hour);
            assert!(!greeting.is_empty(), "empty greeting at hour {hour}");
        }
    }

    #[test]
    fn time_pool_boundaries() {
        // 4 AM = night, 5 AM = morning, 12 PM = afternoon, 17 = evening
        assert_eq!(time_pool(4), NIGHT);
        assert_eq!(time_pool(5), MORNING);
        assert_eq!(time_pool(11), MORNING);
        assert_eq!(time_pool(12), AFTERNOON);
        assert_eq!(time_pool(16), AFTERNOON);
        assert_eq!(time_pool(17), EVENING);
        assert_eq!(time_pool(20), EVENING);
        assert_eq!(time_pool(21), NIGHT);
    }
}
