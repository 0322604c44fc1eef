use crate::error::{KpiError, Result};
use crate::schema::ReferenceMonth;
use chrono::{Days, NaiveDate};

pub fn first_day_of_month(year: i32, month: u32) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| KpiError::DateError(format!("Invalid year-month {:04}-{:02}", year, month)))
}

pub fn last_day_of_month(year: i32, month: u32) -> Result<NaiveDate> {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    first_day_of_month(next_year, next_month)?
        .checked_sub_days(Days::new(1))
        .ok_or_else(|| KpiError::DateError(format!("No last day for {:04}-{:02}", year, month)))
}

pub fn months_between(start: ReferenceMonth, end: ReferenceMonth) -> i64 {
    month_index(end) - month_index(start)
}

/// Shifts a month by `delta` months (negative goes back in time).
pub fn shift_month(month: ReferenceMonth, delta: i32) -> Result<ReferenceMonth> {
    let index = month_index(month) + i64::from(delta);
    let year = i32::try_from(index.div_euclid(12)).map_err(|_| {
        KpiError::DateError(format!("{} shifted by {} months is out of range", month, delta))
    })?;
    let month0 = index.rem_euclid(12) as u32;
    ReferenceMonth::new(year, month0 + 1)
}

// Months since year 0, wide enough for any i32 year
fn month_index(month: ReferenceMonth) -> i64 {
    i64::from(month.year()) * 12 + i64::from(month.month0())
}

/// Every month from `current - months_back` through `current`, oldest first.
pub fn months_in_window(current: ReferenceMonth, months_back: u32) -> Result<Vec<ReferenceMonth>> {
    let months_back = i32::try_from(months_back)
        .map_err(|_| KpiError::InvalidWindow(format!("months_back {} is too large", months_back)))?;

    (-months_back..=0)
        .map(|delta| shift_month(current, delta))
        .collect()
}

/// Parses "YYYY-MM" (also accepts "MM/YYYY", the legacy `mes_formatado` form).
pub fn parse_reference_month(text: &str) -> Result<ReferenceMonth> {
    let text = text.trim();

    let (year, month) = if let Some((month, year)) = text.split_once('/') {
        (year, month)
    } else if let Some((year, month)) = text.split_once('-') {
        (year, month)
    } else {
        return Err(KpiError::DateError(format!(
            "Invalid reference month: {}. Expected YYYY-MM",
            text
        )));
    };

    let year: i32 = year.trim().parse().map_err(|_| {
        KpiError::DateError(format!("Invalid year in reference month: {}", text))
    })?;
    let month: u32 = month.trim().parse().map_err(|_| {
        KpiError::DateError(format!("Invalid month in reference month: {}", text))
    })?;

    ReferenceMonth::new(year, month)
}

pub(crate) fn month_bounds(month: ReferenceMonth) -> Result<(NaiveDate, NaiveDate)> {
    Ok((
        first_day_of_month(month.year(), month.month())?,
        last_day_of_month(month.year(), month.month())?,
    ))
}

/// Month of the local calendar date.
pub fn today_month() -> ReferenceMonth {
    ReferenceMonth::of(chrono::Local::now().date_naive())
}
