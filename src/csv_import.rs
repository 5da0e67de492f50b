// =============================================================================
// CSV import — historical bar loader
// =============================================================================
//
// Hand-rolled row iterator rather than a CSV crate: the contract is narrow
// (one fixed header, six columns, reject-don't-coerce on malformed rows).
// Explicit `Result` at every row — no panics, no silent coercion.

use crate::error::EngineError;
use crate::types::Bar;

/// Case-sensitive header contract: `time,open,high,low,close,Volume`. Extra
/// trailing columns are ignored; these five-plus-one are required in order.
const EXPECTED_HEADER: &[&str] = &["time", "open", "high", "low", "close", "Volume"];

/// Parse a CSV document into closed bars. `max_rows` bounds the accepted row
/// count (excluding the header); exceeding it is `E_Oversize` rather than a
/// silent truncation.
pub fn parse_csv(content: &str, max_rows: usize) -> Result<Vec<Bar>, EngineError> {
    let mut lines = content.lines();

    let header = lines
        .next()
        .ok_or_else(|| EngineError::BadInput("empty CSV: missing header row".to_string()))?;
    let cols: Vec<&str> = header.split(',').map(|c| c.trim()).collect();
    if cols.len() < EXPECTED_HEADER.len() || &cols[..EXPECTED_HEADER.len()] != EXPECTED_HEADER {
        return Err(EngineError::BadInput(format!(
            "unexpected CSV header: expected {} got {:?}",
            EXPECTED_HEADER.join(","),
            cols
        )));
    }

    let mut bars = Vec::new();
    for (row_idx, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if bars.len() >= max_rows {
            return Err(EngineError::Oversize);
        }

        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < EXPECTED_HEADER.len() {
            return Err(EngineError::BadInput(format!(
                "row {}: expected {} columns, got {}",
                row_idx + 2,
                EXPECTED_HEADER.len(),
                fields.len()
            )));
        }

        let parse_field = |raw: &str, name: &str| -> Result<f64, EngineError> {
            raw.trim().parse::<f64>().map_err(|_| {
                EngineError::BadInput(format!("row {}: invalid {name} {raw:?}", row_idx + 2))
            })
        };

        let epoch_start: i64 = fields[0].trim().parse().map_err(|_| {
            EngineError::BadInput(format!(
                "row {}: invalid time {:?} (expected integer Unix seconds)",
                row_idx + 2,
                fields[0]
            ))
        })?;
        let open = parse_field(fields[1], "open")?;
        let high = parse_field(fields[2], "high")?;
        let low = parse_field(fields[3], "low")?;
        let close = parse_field(fields[4], "close")?;
        let volume = parse_field(fields[5], "Volume")?;

        let bar = Bar {
            epoch_start,
            open,
            high,
            low,
            close,
            volume,
            synthetic: false,
        };
        if !bar.is_valid() {
            return Err(EngineError::BadInput(format!(
                "row {}: bar fails OHLC/volume invariant",
                row_idx + 2
            )));
        }
        bars.push(bar);
    }

    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_rows() {
        let csv = "time,open,high,low,close,Volume\n0,100,101,99,100.5,10\n300,100.5,102,100,101,15\n";
        let bars = parse_csv(csv, 10_000).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].epoch_start, 0);
        assert_eq!(bars[1].epoch_start, 300);
    }

    #[test]
    fn rejects_lowercase_volume_header() {
        let csv = "time,open,high,low,close,volume\n0,100,101,99,100.5,10\n";
        assert!(matches!(
            parse_csv(csv, 10_000),
            Err(EngineError::BadInput(_))
        ));
    }

    #[test]
    fn ignores_extra_trailing_columns() {
        let csv = "time,open,high,low,close,Volume,extra\n0,100,101,99,100.5,10,ignored\n";
        let bars = parse_csv(csv, 10_000).unwrap();
        assert_eq!(bars.len(), 1);
    }

    #[test]
    fn rejects_invalid_ohlc() {
        let csv = "time,open,high,low,close,Volume\n0,100,95,105,102,10\n";
        assert!(matches!(
            parse_csv(csv, 10_000),
            Err(EngineError::BadInput(_))
        ));
    }

    #[test]
    fn oversize_beyond_max_rows() {
        let mut csv = String::from("time,open,high,low,close,Volume\n");
        for i in 0..5 {
            csv.push_str(&format!("{},100,101,99,100.5,10\n", i * 300));
        }
        assert!(matches!(parse_csv(&csv, 3), Err(EngineError::Oversize)));
    }

    #[test]
    fn blank_lines_are_skipped() {
        let csv = "time,open,high,low,close,Volume\n0,100,101,99,100.5,10\n\n300,100.5,102,100,101,15\n";
        let bars = parse_csv(csv, 10_000).unwrap();
        assert_eq!(bars.len(), 2);
    }

    #[test]
    fn non_numeric_field_is_bad_input() {
        let csv = "time,open,high,low,close,Volume\n0,abc,101,99,100.5,10\n";
        assert!(matches!(
            parse_csv(csv, 10_000),
            Err(EngineError::BadInput(_))
        ));
    }
}
