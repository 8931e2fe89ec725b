mod helpers;
mod repair_scenarios;
