pub mod time;

pub use time::{
    bar_in_window, compact_date, current_human_timestamp, end_of_day, is_weekday, start_of_day,
    weekdays_between,
};
