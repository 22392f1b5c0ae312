use crate::sheet::CellValue;

/// Converts a database value to a number for the sheet.
///
/// Missing, empty and `"None"` values become `0`. Values without a fractional part
/// are written as integers so the sheet doesn't show `12.0`.
pub fn to_cell_number(raw: Option<&str>) -> CellValue {
    let Some(raw) = raw.map(str::trim) else {
        return CellValue::Int(0);
    };
    if raw.is_empty() || raw == "None" {
        return CellValue::Int(0);
    }
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 => {
            CellValue::Int(value as i64)
        }
        Ok(value) if value.is_finite() => CellValue::Number(value),
        _ => {
            log::warn!("Could not convert {raw:?} to a number. Using 0.");
            CellValue::Int(0)
        }
    }
}

/// Parses an IUGU money string such as `"R$ 1.234,56"`.
///
/// Plain decimal strings (`"1234.56"`) are accepted as well. A comma marks the
/// decimal separator when present; dots are then thousands separators.
pub fn parse_brl(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let negative = trimmed.starts_with('-') || trimmed.contains("-R$") || trimmed.contains("R$ -");
    let digits: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    if !digits.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let normalized = if digits.contains(',') {
        digits.replace('.', "").replace(',', ".")
    } else {
        digits
    };
    let value: f64 = normalized.parse().ok()?;
    Some(if negative { -value } else { value })
}
