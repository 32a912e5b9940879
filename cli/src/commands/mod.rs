mod exercise;
mod food;
mod goals;
mod helpers;
mod import;
mod onboarding;
mod profile;
mod steps;
mod sync;
mod weight;

pub(crate) use exercise::{cmd_exercise_delete, cmd_exercise_list, cmd_exercise_log};
pub(crate) use food::{
    cmd_food_delete, cmd_food_list, cmd_food_log, cmd_food_update, cmd_meal_delete, cmd_meal_log,
};
pub(crate) use goals::{
    cmd_cheat_day_complete, cmd_cheat_day_set, cmd_cheat_day_status, cmd_streak_recompute,
    cmd_streak_show,
};
pub(crate) use import::cmd_import_csv;
pub(crate) use onboarding::{
    cmd_onboarding_consume, cmd_onboarding_purge, cmd_onboarding_save, cmd_onboarding_show,
    cmd_purge,
};
pub(crate) use profile::{ProfileArgs, cmd_profile_set, cmd_profile_show};
pub(crate) use steps::{
    cmd_steps_cache, cmd_steps_health, cmd_steps_override, cmd_steps_run, cmd_steps_show,
};
pub(crate) use sync::{cmd_sync_list, cmd_sync_mark, cmd_sync_pending, cmd_sync_tombstones};
pub(crate) use weight::{cmd_weight_delete, cmd_weight_history, cmd_weight_log};
