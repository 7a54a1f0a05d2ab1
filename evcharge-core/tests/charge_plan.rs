#![allow(clippy::unwrap_used)]
mod common;

use chrono::TimeDelta;
use common::{day_1_prices, dt, scenario_a_config, scenario_a_prices, TIMEZONE};
use evcharge_core::{
    charge_plan::{
        lowest_prices, ChargePlan, ChargePlanner, ChargeWindow, PlanDeferred, PlanLabels,
    },
    datetime::parse_time_of_day,
};
use float_cmp::assert_approx_eq;
use rstest::rstest;

const REFERENCE: &str = "2019-04-02T17:00:00+02:00";

fn planner() -> ChargePlanner {
    ChargePlanner::new(scenario_a_config(), TIMEZONE)
}

fn plan() -> ChargePlan {
    planner()
        .create_plan(&scenario_a_prices(), dt(REFERENCE))
        .unwrap()
}

fn charging(plan: &ChargePlan) -> Vec<(String, String)> {
    plan.segments()
        .iter()
        .filter(|s| s.charge)
        .map(|s| (s.starts_at.to_rfc3339(), s.ends_at.to_rfc3339()))
        .collect()
}

fn span(start: &str, end: &str) -> (String, String) {
    (dt(start).to_rfc3339(), dt(end).to_rfc3339())
}

#[test]
fn test_planner_values() {
    let planner = planner();
    let reference = dt(REFERENCE);

    assert_approx_eq!(f64, planner.max_battery_range(), 495.522_388_059_701_5);
    assert_approx_eq!(f64, planner.max_to_charge(reference), 113.970_149_253_731_34);
    assert_approx_eq!(f64, planner.hours_in_window(reference), 8.5);
    assert_approx_eq!(f64, planner.charge_hours(reference, None), 4.07);
    assert_eq!(planner.charge_hours_formatted(reference), "4:04");
}

#[test]
fn test_max_to_charge_limited_by_window() {
    let mut config = scenario_a_config();
    config.charge_km_per_hour = 10.0;
    let planner = ChargePlanner::new(config, TIMEZONE);
    assert_approx_eq!(f64, planner.max_to_charge(dt(REFERENCE)), 85.0);
}

#[rstest]
#[case(Some(4.0), 4.0)]
#[case(Some(2.0), 2.0)]
#[case(Some(10.0), 4.07)]
#[case(None, 4.07)]
fn test_charge_max_hours(#[case] max_hours: Option<f64>, #[case] expected: f64) {
    let mut config = scenario_a_config();
    config.charge_max_hours = max_hours;
    let planner = ChargePlanner::new(config, TIMEZONE);
    assert_approx_eq!(f64, planner.charge_hours(dt(REFERENCE), None), expected);
}

#[test]
fn test_plan_is_idempotent() {
    let planner = planner();
    let prices = scenario_a_prices();
    let first = planner.create_plan(&prices, dt(REFERENCE)).unwrap();
    let second = planner.create_plan(&prices, dt(REFERENCE)).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.segments(), second.segments());
}

#[rstest]
#[case("22:00", "06:30", "2019-04-02T17:00:00+02:00", Some(("2019-04-02T22:00:00+02:00", 9)))]
#[case("22:00", "06:30", "2019-04-02T23:30:00+02:00", Some(("2019-04-02T22:00:00+02:00", 9)))]
#[case("22:00", "06:30", "2019-04-03T00:30:00+02:00", None)]
#[case("01:00", "05:00", "2019-04-02T17:00:00+02:00", Some(("2019-04-02T01:00:00+02:00", 4)))]
#[case("01:00", "05:00", "2019-04-03T00:30:00+02:00", Some(("2019-04-03T01:00:00+02:00", 4)))]
#[case("00:00", "00:00", "2019-04-02T17:00:00+02:00", Some(("2019-04-02T00:00:00+02:00", 24)))]
fn test_plan_window_on_reference_day(
    #[case] start: &str,
    #[case] end: &str,
    #[case] reference: &str,
    #[case] expected: Option<(&str, usize)>,
) {
    let mut config = scenario_a_config();
    config.charge_start = parse_time_of_day(start).unwrap();
    config.charge_end = parse_time_of_day(end).unwrap();
    let planner = ChargePlanner::new(config, TIMEZONE);

    let result = planner.create_plan(&scenario_a_prices(), dt(reference));
    match expected {
        Some((first, count)) => {
            let plan = result.unwrap();
            assert_eq!(plan.segments().first().unwrap().starts_at, dt(first));
            assert_eq!(plan.segments().len(), count);
        }
        None => assert_eq!(result, Err(PlanDeferred::MissingPrices)),
    }
}

#[test]
fn test_plan_for_window_running_after_midnight() {
    let config = scenario_a_config();
    let window = ChargeWindow::current(
        config.charge_start,
        config.charge_end,
        dt("2019-04-03T00:30:00+02:00"),
        &TIMEZONE,
    );
    let plan = ChargePlanner::new(config, TIMEZONE)
        .create_plan(&scenario_a_prices(), window.starting_at())
        .unwrap();
    assert_eq!(plan, self::plan());
    assert!(plan.should_charge(dt("2019-04-03T00:30:00+02:00")));
}

#[test]
fn test_complete_prices() {
    let planner = planner();
    assert!(planner.has_complete_prices(&scenario_a_prices(), dt(REFERENCE)));
    assert!(!planner.has_complete_prices(&day_1_prices(), dt(REFERENCE)));
    assert_eq!(
        planner.create_plan(&day_1_prices(), dt(REFERENCE)),
        Err(PlanDeferred::MissingPrices)
    );
}

#[test]
fn test_plan_segments() {
    let plan = plan();

    assert_eq!(plan.segments().len(), 9);
    assert_eq!(
        plan.segments().first().unwrap().starts_at,
        dt("2019-04-02T22:00:00+02:00")
    );
    assert_eq!(
        plan.segments().last().unwrap().starts_at,
        dt("2019-04-03T06:00:00+02:00")
    );
    assert_eq!(
        charging(&plan),
        vec![
            span("2019-04-03T00:00:00+02:00", "2019-04-03T01:00:00+02:00"),
            span("2019-04-03T01:00:00+02:00", "2019-04-03T01:04:12+02:00"),
            span("2019-04-03T02:00:00+02:00", "2019-04-03T03:00:00+02:00"),
            span("2019-04-03T03:00:00+02:00", "2019-04-03T04:00:00+02:00"),
            span("2019-04-03T04:00:00+02:00", "2019-04-03T05:00:00+02:00"),
        ]
    );
    assert_eq!(plan.sum_charge_hours(), TimeDelta::milliseconds(14_652_000));
    assert_approx_eq!(f64, plan.cost_reduction().unwrap(), -0.017_888_55, epsilon = 1e-9);
}

#[test]
fn test_plan_as_text() {
    let labels = PlanLabels {
        charge_plan: "Label1".into(),
        charge_hours: "Label2".into(),
        cost_reduction: "Label3".into(),
    };
    assert_eq!(
        plan().as_text(&labels, "NOK"),
        "Label1: 114 km\n\
         Label2: 04:04\n\
         Label3: 1.79 %\n\
         00:00-01:00: 0.3583 NOK/kWh\n\
         01:00-01:04: 0.35965 NOK/kWh\n\
         02:00-03:00: 0.35927 NOK/kWh\n\
         03:00-04:00: 0.35927 NOK/kWh\n\
         04:00-05:00: 0.35609 NOK/kWh"
    );
}

#[test]
fn test_plan_limited_hours() {
    let mut config = scenario_a_config();
    config.charge_max_hours = Some(2.0);
    let plan = ChargePlanner::new(config, TIMEZONE)
        .create_plan(&scenario_a_prices(), dt(REFERENCE))
        .unwrap();

    assert_approx_eq!(f64, plan.charge_hours(), 2.0);
    assert_eq!(
        charging(&plan),
        vec![
            span("2019-04-03T00:00:00+02:00", "2019-04-03T01:00:00+02:00"),
            span("2019-04-03T04:00:00+02:00", "2019-04-03T05:00:00+02:00"),
        ]
    );
}

#[test]
fn test_override_whole_hours() {
    let plan = planner()
        .create_plan_with_hours(&scenario_a_prices(), dt(REFERENCE), Some(4.0))
        .unwrap();
    assert_eq!(
        charging(&plan),
        vec![
            span("2019-04-03T00:00:00+02:00", "2019-04-03T01:00:00+02:00"),
            span("2019-04-03T02:00:00+02:00", "2019-04-03T03:00:00+02:00"),
            span("2019-04-03T03:00:00+02:00", "2019-04-03T04:00:00+02:00"),
            span("2019-04-03T04:00:00+02:00", "2019-04-03T05:00:00+02:00"),
        ]
    );
}

#[test]
fn test_override_minimum_fraction() {
    let plan = planner()
        .create_plan_with_hours(&scenario_a_prices(), dt(REFERENCE), Some(4.01))
        .unwrap();
    let segment = plan
        .charge_at_moment(dt("2019-04-03T01:00:00+02:00"))
        .unwrap();
    assert!(segment.charge);
    assert_eq!(segment.ends_at, dt("2019-04-03T01:03:00+02:00"));
}

#[rstest]
#[case("2019-04-04T00:20:00+02:00", None)]
#[case("2019-04-02T17:00:00+02:00", None)]
#[case("2019-04-03T00:20:00+02:00", Some(("2019-04-03T00:00:00+02:00", true)))]
#[case("2019-04-03T05:00:00+02:00", Some(("2019-04-03T05:00:00+02:00", false)))]
#[case("2019-04-03T01:00:00+02:00", Some(("2019-04-03T01:00:00+02:00", true)))]
#[case("2019-04-03T01:30:00+02:00", Some(("2019-04-03T01:00:00+02:00", true)))]
fn test_charge_at_moment(#[case] now: &str, #[case] expected: Option<(&str, bool)>) {
    let plan = plan();
    let segment = plan
        .charge_at_moment(dt(now))
        .map(|s| (s.starts_at, s.charge));
    assert_eq!(segment, expected.map(|(start, charge)| (dt(start), charge)));
}

#[rstest]
#[case("2019-04-03T00:20:00+02:00", true)]
#[case("2019-04-03T01:04:11+02:00", true)]
#[case("2019-04-03T01:04:12+02:00", false)]
#[case("2019-04-03T01:30:00+02:00", false)]
#[case("2019-04-03T05:00:00+02:00", false)]
#[case("2019-04-02T23:00:00+02:00", false)]
fn test_should_charge(#[case] now: &str, #[case] expected: bool) {
    assert_eq!(plan().should_charge(dt(now)), expected);
}

#[rstest]
#[case("2019-04-02T21:59:59+02:00", true)]
#[case("2019-04-02T22:00:00+02:00", false)]
fn test_is_before_plan(#[case] now: &str, #[case] expected: bool) {
    assert_eq!(plan().is_before_plan(dt(now)), expected);
}

#[rstest]
#[case("2019-04-03T07:00:00+02:00", true)]
#[case("2019-04-03T06:59:59+02:00", false)]
fn test_is_after_plan(#[case] now: &str, #[case] expected: bool) {
    assert_eq!(plan().is_after_plan(dt(now)), expected);
}

#[rstest]
#[case("2019-04-02T22:00:00+02:00", true)]
#[case("2019-04-02T22:59:59+02:00", true)]
#[case("2019-04-02T23:00:00+02:00", false)]
fn test_is_first_period(#[case] now: &str, #[case] expected: bool) {
    assert_eq!(plan().is_first_period(dt(now)), expected);
}

#[rstest]
#[case("2019-04-03T06:00:00+02:00", false, true)]
#[case("2019-04-03T05:59:59+02:00", false, false)]
#[case("2019-04-03T04:00:00+02:00", true, true)]
#[case("2019-04-03T04:59:59+02:00", true, true)]
#[case("2019-04-03T05:00:00+02:00", true, false)]
fn test_is_last_period(#[case] now: &str, #[case] only_charging: bool, #[case] expected: bool) {
    assert_eq!(plan().is_last_period(dt(now), only_charging), expected);
}

#[test]
fn test_lowest_prices_in_window() {
    let window = planner().window(dt(REFERENCE));
    let in_window = scenario_a_prices().in_period(window.starting_at(), window.ending_at());

    let lowest: Vec<_> = lowest_prices(&in_window, 3.0)
        .iter()
        .map(|p| p.starts_at)
        .collect();
    assert_eq!(
        lowest,
        vec![
            dt("2019-04-03T04:00:00+02:00"),
            dt("2019-04-03T00:00:00+02:00"),
            dt("2019-04-03T02:00:00+02:00"),
        ]
    );
}

#[test]
fn test_lowest_price_overall() {
    let prices = scenario_a_prices();
    let lowest = lowest_prices(prices.points(), 1.0);
    assert_eq!(lowest.len(), 1);
    assert_eq!(lowest[0].starts_at, dt("2019-04-02T05:00:00+02:00"));
    assert_approx_eq!(f64, lowest[0].price, 0.35385);
}

#[test]
fn test_plan_clamped_to_window() {
    let plan = plan();
    let window = plan.window();
    assert!(plan
        .segments()
        .iter()
        .all(|s| s.starts_at >= window.starting_at() && s.starts_at < window.ending_at()));
    assert!(plan.charge_hours() <= window.hours());
}
