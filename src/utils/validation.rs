use crate::error::{MfError, MfResult};
use crate::models::*;

const MAX_ID_LEN: usize = 256;

fn validate_id(kind: EntityKind, id: &str) -> MfResult<()> {
    if id.trim().is_empty() {
        return Err(MfError::invalid(format!("{} id cannot be empty", kind)));
    }
    if id.len() > MAX_ID_LEN {
        return Err(MfError::invalid(format!(
            "{} id too long (max {} bytes)",
            kind, MAX_ID_LEN
        )));
    }
    Ok(())
}

pub fn validate_rating_parts(user_id: &str, item_id: &str, rating: f64) -> MfResult<()> {
    validate_id(EntityKind::User, user_id)?;
    validate_id(EntityKind::Item, item_id)?;
    if !rating.is_finite() {
        return Err(MfError::invalid(format!("rating must be finite, got {}", rating)));
    }
    Ok(())
}

pub fn validate_rating_event(event: &RatingEvent) -> MfResult<()> {
    validate_rating_parts(&event.user_id, &event.item_id, event.rating)
}

pub fn validate_top_k(top_k: usize, max_top_k: usize) -> MfResult<()> {
    if top_k == 0 {
        return Err(MfError::invalid("top_k must be greater than 0"));
    }
    if top_k > max_top_k {
        return Err(MfError::invalid(format!(
            "top_k too large: {} (max {})",
            top_k, max_top_k
        )));
    }
    Ok(())
}

fn corrupt(message: String) -> MfError {
    MfError::CorruptSnapshot(message)
}

/// Structural checks run before a snapshot is turned back into a model.
pub fn validate_snapshot(snapshot: &ModelSnapshot) -> MfResult<()> {
    if snapshot.version != crate::algorithms::SNAPSHOT_VERSION {
        return Err(corrupt(format!("unsupported snapshot version {}", snapshot.version)));
    }
    if snapshot.n_factors == 0 {
        return Err(corrupt("n_factors is zero".to_string()));
    }

    let sides = [
        ("user", snapshot.n_users, &snapshot.p, &snapshot.bu, &snapshot.users),
        ("item", snapshot.n_items, &snapshot.q, &snapshot.bi, &snapshot.items),
    ];
    for (kind, count, rows, biases, ids) in sides {
        if rows.len() != count || biases.len() != count || ids.len() != count {
            return Err(corrupt(format!(
                "{} count {} disagrees with rows {}, biases {}, ids {}",
                kind,
                count,
                rows.len(),
                biases.len(),
                ids.len()
            )));
        }
        if let Some((row, values)) = rows
            .iter()
            .enumerate()
            .find(|(_, values)| values.len() != snapshot.n_factors)
        {
            return Err(corrupt(format!(
                "{} row {} has {} factors, expected {}",
                kind,
                row,
                values.len(),
                snapshot.n_factors
            )));
        }
        if rows.iter().flatten().chain(biases.iter()).any(|v| !v.is_finite()) {
            return Err(corrupt(format!("{} parameters contain NaN or Infinity", kind)));
        }
    }

    if !snapshot.mu.is_finite() || !snapshot.lr.is_finite() || !snapshot.reg.is_finite() {
        return Err(corrupt("scalar parameters contain NaN or Infinity".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::tests::two_by_two;
    use chrono::Utc;

    #[test]
    fn test_validate_rating_event() {
        let valid = RatingEvent::new("u1", "b1", 4.5, Utc::now());
        assert!(validate_rating_event(&valid).is_ok());

        let empty_user = RatingEvent::new("  ", "b1", 4.5, Utc::now());
        assert!(validate_rating_event(&empty_user).is_err());

        let nan = RatingEvent::new("u1", "b1", f64::NAN, Utc::now());
        assert!(validate_rating_event(&nan).is_err());

        let long = RatingEvent::new("u".repeat(300), "b1", 1.0, Utc::now());
        assert!(validate_rating_event(&long).is_err());
    }

    #[test]
    fn test_validate_top_k() {
        assert!(validate_top_k(1, 10).is_ok());
        assert!(validate_top_k(0, 10).is_err());
        assert!(validate_top_k(11, 10).is_err());
    }

    #[test]
    fn test_validate_snapshot() {
        let snapshot = two_by_two().to_snapshot();
        assert!(validate_snapshot(&snapshot).is_ok());

        let mut short_bias = snapshot.clone();
        short_bias.bu.pop();
        assert!(matches!(
            validate_snapshot(&short_bias),
            Err(MfError::CorruptSnapshot(_))
        ));

        let mut ragged = snapshot.clone();
        ragged.q[1].push(0.0);
        assert!(validate_snapshot(&ragged).is_err());

        let mut missing_id = snapshot.clone();
        missing_id.items.pop();
        assert!(validate_snapshot(&missing_id).is_err());

        let mut nan = snapshot;
        nan.p[0][0] = f64::NAN;
        assert!(validate_snapshot(&nan).is_err());
    }
}
