use crate::model::*;

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Aggregate booked hours over `[period_start, period_end]`.
///
/// A reservation is included when its status counts toward occupancy and its
/// `start` falls inside the period (both ends inclusive). `units` is how many
/// spaces the period hours are multiplied by for the denominator: 1 for a
/// single space or user, the bookable space count for a floor or building.
pub fn occupancy<'a>(
    reservations: impl IntoIterator<Item = &'a Reservation>,
    period_start: Ms,
    period_end: Ms,
    units: usize,
) -> OccupancyStats {
    let mut total_reservations = 0usize;
    let mut total_ms: Ms = 0;
    for r in reservations {
        if !r.status.counts_toward_occupancy() {
            continue;
        }
        if r.span.start < period_start || r.span.start > period_end {
            continue;
        }
        total_reservations += 1;
        total_ms += r.span.duration_ms();
    }

    let total_hours = total_ms as f64 / HOUR_MS as f64;
    let period_hours = (period_end - period_start).max(0) as f64 / HOUR_MS as f64;
    let available_hours = period_hours * units as f64;
    let occupancy_rate = if available_hours > 0.0 {
        round2(total_hours / available_hours * 100.0)
    } else {
        0.0
    };

    OccupancyStats {
        total_reservations,
        total_hours: round2(total_hours),
        occupancy_rate,
    }
}
