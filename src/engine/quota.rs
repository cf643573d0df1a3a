use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Count the user's active reservations that touch `span`.
///
/// Bounds are inclusive on both ends, so a reservation ending exactly when
/// the candidate starts still counts. `exclude` skips the reservation being
/// edited.
pub fn count_overlapping(ledger: &UserLedger, span: &Span, exclude: Option<Ulid>) -> usize {
    ledger
        .active
        .iter()
        .filter(|e| Some(e.reservation_id) != exclude)
        .filter(|e| e.span.touches(span))
        .count()
}

pub(crate) fn check_quota(
    ledger: &UserLedger,
    span: &Span,
    exclude: Option<Ulid>,
    rules: &BookingRules,
) -> Result<(), EngineError> {
    let held = count_overlapping(ledger, span, exclude);
    if held >= rules.max_concurrent_reservations as usize {
        return Err(EngineError::QuotaExceeded {
            limit: rules.max_concurrent_reservations,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = HOUR_MS;

    fn ledger(spans: &[Span]) -> UserLedger {
        let mut l = UserLedger::new(Ulid::new());
        for span in spans {
            l.insert(LedgerEntry {
                reservation_id: Ulid::new(),
                space_id: Ulid::new(),
                span: *span,
            });
        }
        l
    }

    #[test]
    fn counts_only_overlapping() {
        let l = ledger(&[
            Span::new(9 * H, 17 * H),
            Span::new(9 * H, 12 * H),
            Span::new(18 * H, 19 * H),
        ]);
        assert_eq!(count_overlapping(&l, &Span::new(10 * H, 11 * H), None), 2);
        assert_eq!(count_overlapping(&l, &Span::new(20 * H, 21 * H), None), 0);
    }

    #[test]
    fn adjacency_counts_toward_quota() {
        let l = ledger(&[Span::new(9 * H, 10 * H)]);
        assert_eq!(count_overlapping(&l, &Span::new(10 * H, 11 * H), None), 1);
        assert_eq!(count_overlapping(&l, &Span::new(8 * H, 9 * H), None), 1);
    }

    #[test]
    fn quota_rejects_at_limit() {
        let rules = BookingRules::default();
        let l = ledger(&[
            Span::new(9 * H, 17 * H),
            Span::new(9 * H, 17 * H),
            Span::new(9 * H, 17 * H),
        ]);
        let err = check_quota(&l, &Span::new(9 * H + H / 2, 10 * H), None, &rules);
        assert!(matches!(err, Err(EngineError::QuotaExceeded { limit: 3 })));

        // Same request outside the busy block is fine.
        assert!(check_quota(&l, &Span::new(18 * H, 19 * H), None, &rules).is_ok());
    }

    #[test]
    fn quota_excludes_edited_reservation() {
        let rules = BookingRules {
            max_concurrent_reservations: 1,
            ..BookingRules::default()
        };
        let l = ledger(&[Span::new(9 * H, 10 * H)]);
        let own = l.active[0].reservation_id;
        assert!(check_quota(&l, &Span::new(9 * H, 11 * H), None, &rules).is_err());
        assert!(check_quota(&l, &Span::new(9 * H, 11 * H), Some(own), &rules).is_ok());
    }

    #[test]
    fn zero_quota_rejects_everything() {
        let rules = BookingRules {
            max_concurrent_reservations: 0,
            ..BookingRules::default()
        };
        let l = ledger(&[]);
        assert!(check_quota(&l, &Span::new(0, H), None, &rules).is_err());
    }
}
