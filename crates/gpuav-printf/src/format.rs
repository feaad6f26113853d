//! printf-style format strings as written in `debugPrintfEXT` calls.
//!
//! A format string is split into [`FormatSubstring`]s, each holding the literal text that precedes
//! at most one conversion. Rendering walks the substrings in order, pulling value words from a
//! [`ValueCursor`]:
//!
//! - `%d`/`%i` are signed, `%u`/`%x`/`%X`/`%o` unsigned and `%f`/`%F`/`%e`/`%E`/`%g`/`%G`/`%a`/`%A`
//!   floating point.
//! - An `l` directly after the conversion (`%ul`, the shader-side convention) or a C-style `l`/`ll`
//!   length modifier before it (`%lu`) marks a 64-bit value, stored as two words, high word first.
//! - `%vNx` (N in 2..=4) expands into N substrings joined by `", "`.
//! - `%%` is a literal percent sign; a `%` that does not start a well-formed conversion is kept as
//!   literal text.

use std::fmt::Write as _;

use crate::error::FormatError;

/// Initial capacity of the buffer a record is rendered into; longer output grows it.
pub const RENDER_BUFFER_CAPACITY: usize = 1024;

/// Upper bound for field widths and precisions.
const MAX_FIELD: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Signed,
    Unsigned,
    Float,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// `-`
    pub left_align: bool,
    /// `+`
    pub plus: bool,
    /// ` `
    pub space: bool,
    /// `0`
    pub zero_pad: bool,
    /// `#`
    pub alternate: bool,
}

/// One conversion specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholder {
    pub conversion: char,
    pub value_type: ValueType,
    pub is_64_bit: bool,
    pub flags: Flags,
    pub width: Option<usize>,
    pub precision: Option<usize>,
}

/// Literal text followed by at most one conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSubstring {
    /// Text printed before the value, with `%%` already collapsed.
    pub literal: String,
    pub placeholder: Option<Placeholder>,
}

impl FormatSubstring {
    fn literal(literal: String) -> Self {
        Self {
            literal,
            placeholder: None,
        }
    }

    pub fn needs_value(&self) -> bool {
        self.placeholder.is_some()
    }

    pub fn value_type(&self) -> Option<ValueType> {
        self.placeholder.map(|p| p.value_type)
    }

    pub fn is_64_bit(&self) -> bool {
        self.placeholder.is_some_and(|p| p.is_64_bit)
    }

    /// Number of record words this substring consumes.
    pub fn value_words(&self) -> usize {
        match self.placeholder {
            None => 0,
            Some(p) if p.is_64_bit => 2,
            Some(_) => 1,
        }
    }

    /// Appends the literal and the formatted value to `out`.
    ///
    /// When the cursor runs dry the literal is still appended before the error is returned.
    pub fn render_into(
        &self,
        values: &mut ValueCursor<'_>,
        out: &mut String,
    ) -> Result<(), FormatError> {
        out.push_str(&self.literal);
        match &self.placeholder {
            Some(placeholder) => placeholder.render(values, out),
            None => Ok(()),
        }
    }
}

/// Reads value words in order.
#[derive(Debug, Clone)]
pub struct ValueCursor<'a> {
    words: &'a [u32],
    position: usize,
}

impl<'a> ValueCursor<'a> {
    pub fn new(words: &'a [u32]) -> Self {
        Self { words, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.words.len() - self.position
    }

    fn next_u32(&mut self) -> Result<u32, FormatError> {
        let word = *self
            .words
            .get(self.position)
            .ok_or(FormatError::ValuesExhausted {
                position: self.position,
            })?;
        self.position += 1;
        Ok(word)
    }

    fn next_u64(&mut self) -> Result<u64, FormatError> {
        if self.remaining() < 2 {
            return Err(FormatError::ValuesExhausted {
                position: self.position,
            });
        }
        let high = self.next_u32()?;
        let low = self.next_u32()?;
        Ok((u64::from(high) << 32) | u64::from(low))
    }
}

/// Splits `format` into substrings. Never fails; the result is never empty.
pub fn parse(format: &str) -> Vec<FormatSubstring> {
    let bytes = format.as_bytes();
    let mut substrings = Vec::new();
    let mut literal = String::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let Some(rel) = format[pos..].find('%') else {
            literal.push_str(&format[pos..]);
            break;
        };
        let percent = pos + rel;
        literal.push_str(&format[pos..percent]);

        if bytes.get(percent + 1) == Some(&b'%') {
            literal.push('%');
            pos = percent + 2;
            continue;
        }

        match parse_conversion(bytes, percent + 1) {
            Some((placeholder, count, end)) => {
                substrings.push(FormatSubstring {
                    literal: std::mem::take(&mut literal),
                    placeholder: Some(placeholder),
                });
                for _ in 1..count {
                    substrings.push(FormatSubstring {
                        literal: ", ".to_string(),
                        placeholder: Some(placeholder),
                    });
                }
                pos = end;
            }
            None => {
                literal.push('%');
                pos = percent + 1;
            }
        }
    }

    if !literal.is_empty() || substrings.is_empty() {
        substrings.push(FormatSubstring::literal(literal));
    }
    substrings
}

/// Renders every substring of `format` against `values`.
pub fn format_values(format: &str, values: &[u32]) -> Result<String, FormatError> {
    let mut cursor = ValueCursor::new(values);
    let mut out = String::with_capacity(RENDER_BUFFER_CAPACITY);
    for substring in parse(format) {
        substring.render_into(&mut cursor, &mut out)?;
    }
    Ok(out)
}

/// Parses flags, width, precision, length and conversion starting just after a `%`.
///
/// Returns the placeholder, how many values it expands to, and the byte offset after it.
fn parse_conversion(bytes: &[u8], start: usize) -> Option<(Placeholder, usize, usize)> {
    let mut i = start;
    let mut flags = Flags::default();
    while let Some(&c) = bytes.get(i) {
        match c {
            b'-' => flags.left_align = true,
            b'+' => flags.plus = true,
            b' ' => flags.space = true,
            b'0' => flags.zero_pad = true,
            b'#' => flags.alternate = true,
            _ => break,
        }
        i += 1;
    }

    let width = parse_digits(bytes, &mut i);
    let precision = if bytes.get(i) == Some(&b'.') {
        i += 1;
        Some(parse_digits(bytes, &mut i).unwrap_or(0))
    } else {
        None
    };

    let mut is_64_bit = false;
    if bytes.get(i) == Some(&b'l') {
        is_64_bit = true;
        i += 1;
        if bytes.get(i) == Some(&b'l') {
            i += 1;
        }
    }

    let mut count = 1;
    if bytes.get(i) == Some(&b'v') {
        count = match bytes.get(i + 1) {
            Some(b'2') => 2,
            Some(b'3') => 3,
            Some(b'4') => 4,
            _ => return None,
        };
        i += 2;
    }

    let conversion = char::from(*bytes.get(i)?);
    let value_type = value_type_for(conversion)?;
    i += 1;

    if bytes.get(i) == Some(&b'l') {
        is_64_bit = true;
        i += 1;
    }

    let placeholder = Placeholder {
        conversion,
        value_type,
        is_64_bit,
        flags,
        width,
        precision,
    };
    Some((placeholder, count, i))
}

fn parse_digits(bytes: &[u8], i: &mut usize) -> Option<usize> {
    let start = *i;
    let mut value: usize = 0;
    while let Some(&c) = bytes.get(*i) {
        if !c.is_ascii_digit() {
            break;
        }
        value = value.saturating_mul(10).saturating_add(usize::from(c - b'0'));
        *i += 1;
    }
    (*i > start).then_some(value.min(MAX_FIELD))
}

fn value_type_for(conversion: char) -> Option<ValueType> {
    match conversion {
        'd' | 'i' => Some(ValueType::Signed),
        'u' | 'x' | 'X' | 'o' => Some(ValueType::Unsigned),
        'f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'a' | 'A' => Some(ValueType::Float),
        _ => None,
    }
}

impl Placeholder {
    fn render(&self, values: &mut ValueCursor<'_>, out: &mut String) -> Result<(), FormatError> {
        match self.value_type {
            ValueType::Signed => {
                let value = if self.is_64_bit {
                    values.next_u64()? as i64
                } else {
                    i64::from(values.next_u32()? as i32)
                };
                self.render_signed(value, out);
            }
            ValueType::Unsigned => {
                let value = if self.is_64_bit {
                    values.next_u64()?
                } else {
                    u64::from(values.next_u32()?)
                };
                self.render_unsigned(value, out);
            }
            ValueType::Float => {
                let value = if self.is_64_bit {
                    f64::from_bits(values.next_u64()?)
                } else {
                    f64::from(f32::from_bits(values.next_u32()?))
                };
                self.render_float(value, out);
            }
        }
        Ok(())
    }

    fn sign(&self, negative: bool) -> &'static str {
        if negative {
            "-"
        } else if self.flags.plus {
            "+"
        } else if self.flags.space {
            " "
        } else {
            ""
        }
    }

    /// Applies the precision as a minimum digit count.
    fn integer_digits(&self, digits: String, is_zero: bool) -> String {
        match self.precision {
            Some(0) if is_zero => String::new(),
            Some(p) if digits.len() < p => {
                let mut padded = "0".repeat(p - digits.len());
                padded.push_str(&digits);
                padded
            }
            _ => digits,
        }
    }

    fn render_signed(&self, value: i64, out: &mut String) {
        let digits = self.integer_digits(value.unsigned_abs().to_string(), value == 0);
        self.pad(out, self.sign(value < 0), "", &digits, self.precision.is_none());
    }

    fn render_unsigned(&self, value: u64, out: &mut String) {
        let alternate = self.flags.alternate && value != 0;
        let (digits, prefix) = match self.conversion {
            'x' => (format!("{value:x}"), if alternate { "0x" } else { "" }),
            'X' => (format!("{value:X}"), if alternate { "0X" } else { "" }),
            'o' => (format!("{value:o}"), ""),
            _ => (value.to_string(), ""),
        };
        let mut digits = self.integer_digits(digits, value == 0);
        if self.conversion == 'o' && self.flags.alternate && !digits.starts_with('0') {
            digits.insert(0, '0');
        }
        self.pad(out, "", prefix, &digits, self.precision.is_none());
    }

    fn render_float(&self, value: f64, out: &mut String) {
        let upper = self.conversion.is_ascii_uppercase();
        let sign = self.sign(value.is_sign_negative() && !value.is_nan());
        let magnitude = value.abs();

        if !magnitude.is_finite() {
            let body = match (magnitude.is_nan(), upper) {
                (true, false) => "nan",
                (true, true) => "NAN",
                (false, false) => "inf",
                (false, true) => "INF",
            };
            self.pad(out, sign, "", body, false);
            return;
        }

        let alternate = self.flags.alternate;
        match self.conversion.to_ascii_lowercase() {
            'e' => {
                let body = exponential(magnitude, self.precision.unwrap_or(6), alternate, upper);
                self.pad(out, sign, "", &body, true);
            }
            'g' => {
                let body = general(magnitude, self.precision, alternate, upper);
                self.pad(out, sign, "", &body, true);
            }
            'a' => {
                let body = hex_float(magnitude, self.precision, alternate, upper);
                self.pad(out, sign, if upper { "0X" } else { "0x" }, &body, true);
            }
            _ => {
                let body = fixed(magnitude, self.precision.unwrap_or(6), alternate);
                self.pad(out, sign, "", &body, true);
            }
        }
    }

    fn pad(&self, out: &mut String, sign: &str, prefix: &str, body: &str, zero_allowed: bool) {
        let len = sign.len() + prefix.len() + body.chars().count();
        let fill = self.width.unwrap_or(0).saturating_sub(len);
        if self.flags.left_align {
            out.push_str(sign);
            out.push_str(prefix);
            out.push_str(body);
            out.extend(std::iter::repeat(' ').take(fill));
        } else if self.flags.zero_pad && zero_allowed {
            out.push_str(sign);
            out.push_str(prefix);
            out.extend(std::iter::repeat('0').take(fill));
            out.push_str(body);
        } else {
            out.extend(std::iter::repeat(' ').take(fill));
            out.push_str(sign);
            out.push_str(prefix);
            out.push_str(body);
        }
    }
}

fn fixed(magnitude: f64, precision: usize, alternate: bool) -> String {
    let mut body = format!("{magnitude:.precision$}");
    if alternate && precision == 0 {
        body.push('.');
    }
    body
}

fn exponential(magnitude: f64, precision: usize, alternate: bool, upper: bool) -> String {
    let formatted = format!("{magnitude:.precision$e}");
    let (mantissa, exponent) = formatted
        .split_once('e')
        .unwrap_or((formatted.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    let mut body = mantissa.to_string();
    if alternate && precision == 0 {
        body.push('.');
    }
    body.push(if upper { 'E' } else { 'e' });
    body.push(if exponent < 0 { '-' } else { '+' });
    let _ = write!(body, "{:02}", exponent.unsigned_abs());
    body
}

fn general(magnitude: f64, precision: Option<usize>, alternate: bool, upper: bool) -> String {
    let p = match precision {
        Some(0) => 1,
        Some(p) => p,
        None => 6,
    };
    // Exponent after rounding to `p` significant digits.
    let x = if magnitude == 0.0 {
        0
    } else {
        let formatted = format!("{magnitude:.prec$e}", prec = p - 1);
        formatted
            .split_once('e')
            .and_then(|(_, e)| e.parse::<i64>().ok())
            .unwrap_or(0)
    };

    let p_signed = p as i64;
    let body = if x < p_signed && x >= -4 {
        fixed(magnitude, (p_signed - 1 - x) as usize, alternate)
    } else {
        exponential(magnitude, p - 1, alternate, upper)
    };
    if alternate {
        body
    } else {
        strip_trailing_zeros(&body)
    }
}

fn strip_trailing_zeros(body: &str) -> String {
    let (mantissa, exponent) = match body.find(['e', 'E']) {
        Some(at) => body.split_at(at),
        None => (body, ""),
    };
    let mantissa = if mantissa.contains('.') {
        mantissa.trim_end_matches('0').trim_end_matches('.')
    } else {
        mantissa
    };
    format!("{mantissa}{exponent}")
}

/// `%a` body without the `0x` prefix.
fn hex_float(magnitude: f64, precision: Option<usize>, alternate: bool, upper: bool) -> String {
    const MANTISSA_DIGITS: usize = 13;

    let bits = magnitude.to_bits();
    let raw_exponent = ((bits >> 52) & 0x7ff) as i32;
    let mantissa = bits & ((1u64 << 52) - 1);
    let (lead, exponent) = match (raw_exponent, mantissa) {
        (0, 0) => (0u64, 0),
        (0, _) => (0, -1022),
        _ => (1, raw_exponent - 1023),
    };

    let (lead, fraction) = match precision {
        None => {
            let digits = format!("{mantissa:013x}");
            (lead, digits.trim_end_matches('0').to_string())
        }
        Some(p) if p >= MANTISSA_DIGITS => {
            let mut digits = format!("{mantissa:013x}");
            digits.push_str(&"0".repeat(p - MANTISSA_DIGITS));
            (lead, digits)
        }
        Some(p) => {
            // Round half to even at `p` hex digits.
            let full = (lead << 52) | mantissa;
            let shift = (MANTISSA_DIGITS - p) * 4;
            let kept = full >> shift;
            let rest = full & ((1u64 << shift) - 1);
            let half = 1u64 << (shift - 1);
            let rounded = if rest > half || (rest == half && kept & 1 == 1) {
                kept + 1
            } else {
                kept
            };
            let fraction_bits = p * 4;
            let fraction = rounded & ((1u64 << fraction_bits) - 1);
            let digits = if p == 0 {
                String::new()
            } else {
                format!("{fraction:0p$x}")
            };
            (rounded >> fraction_bits, digits)
        }
    };

    let mut body = format!("{lead:x}");
    if !fraction.is_empty() || alternate {
        body.push('.');
        body.push_str(&fraction);
    }
    let _ = write!(body, "p{}{}", if exponent < 0 { '-' } else { '+' }, exponent.unsigned_abs());
    if upper {
        body.make_ascii_uppercase();
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn f(x: f32) -> u32 {
        x.to_bits()
    }

    fn render(format: &str, values: &[u32]) -> String {
        format_values(format, values).unwrap()
    }

    #[test]
    fn splits_at_each_conversion() {
        let subs = parse("x=%d y=%f");
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].literal, "x=");
        assert_eq!(subs[0].value_type(), Some(ValueType::Signed));
        assert_eq!(subs[1].literal, " y=");
        assert_eq!(subs[1].value_type(), Some(ValueType::Float));
        assert!(subs.iter().all(|s| !s.is_64_bit()));
    }

    #[test]
    fn vector_conversions_expand() {
        let subs = parse("%v3f");
        assert_eq!(subs.len(), 3);
        assert_eq!(subs[0].literal, "");
        assert_eq!(subs[1].literal, ", ");
        assert_eq!(subs[2].literal, ", ");
        assert!(subs.iter().all(|s| s.value_type() == Some(ValueType::Float)));

        assert_eq!(
            render("v = (%v2x)", &[1, 255]),
            "v = (1, ff)"
        );
    }

    #[test]
    fn escaped_percent_is_literal() {
        let subs = parse("100%%");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].literal, "100%");
        assert!(!subs[0].needs_value());
        assert_eq!(render("100%%", &[]), "100%");
    }

    #[test]
    fn literal_only_strings_give_one_substring() {
        assert_eq!(parse(""), vec![FormatSubstring::literal(String::new())]);
        assert_eq!(parse("hello").len(), 1);
    }

    #[test]
    fn trailing_or_unknown_percent_stays_literal() {
        assert_eq!(
            parse("abc %"),
            vec![FormatSubstring::literal("abc %".to_string())]
        );
        assert_eq!(render("%s and %5", &[]), "%s and %5");
        assert_eq!(render("%v5d", &[]), "%v5d");
    }

    #[test]
    fn long_modifiers_mark_64_bit() {
        for format in ["%lu", "%llu", "%ul"] {
            let subs = parse(format);
            assert_eq!(subs.len(), 1, "{format}");
            assert!(subs[0].is_64_bit(), "{format}");
            assert_eq!(subs[0].value_words(), 2);
        }
        assert_eq!(render("%lu", &[1, 0]), "4294967296");
        assert_eq!(render("%lx", &[0xdead, 0xbeef]), "dead0000beef");
        assert_eq!(render("%ld", &[u32::MAX, u32::MAX]), "-1");
        let bits = 2.5f64.to_bits();
        assert_eq!(
            render("%lf", &[(bits >> 32) as u32, bits as u32]),
            "2.500000"
        );
    }

    #[test]
    fn integers() {
        assert_eq!(render("%u", &[42]), "42");
        assert_eq!(render("%d", &[u32::MAX]), "-1");
        assert_eq!(render("%i", &[7]), "7");
        assert_eq!(render("%x", &[255]), "ff");
        assert_eq!(render("%#X", &[255]), "0XFF");
        assert_eq!(render("%#x", &[0]), "0");
        assert_eq!(render("%o", &[8]), "10");
        assert_eq!(render("%#o", &[8]), "010");
        assert_eq!(render("%+d", &[5]), "+5");
        assert_eq!(render("% d", &[5]), " 5");
        assert_eq!(render("%-5d|", &[7]), "7    |");
        assert_eq!(render("%05d", &[(-42i32) as u32]), "-0042");
        assert_eq!(render("%5.3d", &[7]), "  007");
        assert_eq!(render("%.0d", &[0]), "");
        assert_eq!(render("%08x", &[0xabc]), "00000abc");
    }

    #[test]
    fn floats() {
        assert_eq!(render("%f", &[f(1.5)]), "1.500000");
        assert_eq!(render("%08.3f", &[f(3.14159)]), "0003.142");
        assert_eq!(render("%.0f", &[f(2.0)]), "2");
        assert_eq!(render("%#.0f", &[f(2.0)]), "2.");
        assert_eq!(render("%+.1f", &[f(0.75)]), "+0.8");
        assert_eq!(render("%f", &[f(-0.0)]), "-0.000000");
        assert_eq!(render("%e", &[f(12345.678)]), "1.234568e+04");
        assert_eq!(render("%E", &[f(0.001)]), "1.000000E-03");
        assert_eq!(render("%.2e", &[f(0.0)]), "0.00e+00");
    }

    #[test]
    fn general_float_switches_style() {
        assert_eq!(render("%g", &[f(0.0001)]), "0.0001");
        assert_eq!(render("%g", &[f(0.00001)]), "1e-05");
        assert_eq!(render("%g", &[f(100000.0)]), "100000");
        assert_eq!(render("%g", &[f(1_000_000.0)]), "1e+06");
        assert_eq!(render("%.3g", &[f(3.14159)]), "3.14");
        assert_eq!(render("%G", &[f(1.0e-10)]), "1E-10");
        assert_eq!(render("%#g", &[f(1.0)]), "1.00000");
        assert_eq!(render("%g", &[f(0.0)]), "0");
    }

    #[test]
    fn hex_floats() {
        assert_eq!(render("%a", &[f(1.0)]), "0x1p+0");
        assert_eq!(render("%a", &[f(1.5)]), "0x1.8p+0");
        assert_eq!(render("%a", &[f(0.5)]), "0x1p-1");
        assert_eq!(render("%A", &[f(-10.0)]), "-0X1.4P+3");
        assert_eq!(render("%.2a", &[f(1.0)]), "0x1.00p+0");
        assert_eq!(render("%a", &[f(0.0)]), "0x0p+0");
    }

    #[test]
    fn non_finite_floats() {
        assert_eq!(render("%f", &[f(f32::INFINITY)]), "inf");
        assert_eq!(render("%F", &[f(f32::NEG_INFINITY)]), "-INF");
        assert_eq!(render("%5f", &[f(f32::NAN)]), "  nan");
        assert_eq!(render("%05f", &[f(f32::INFINITY)]), "  inf");
    }

    #[test]
    fn running_out_of_values_is_an_error() {
        assert_eq!(
            format_values("%d %d", &[1]),
            Err(FormatError::ValuesExhausted { position: 1 })
        );
        assert_eq!(
            format_values("%lu", &[1]),
            Err(FormatError::ValuesExhausted { position: 0 })
        );

        let mut out = String::new();
        let mut cursor = ValueCursor::new(&[]);
        let sub = &parse("value: %d")[0];
        assert!(sub.render_into(&mut cursor, &mut out).is_err());
        assert_eq!(out, "value: ");
    }

    #[test]
    fn long_output_grows_past_initial_capacity() {
        let long = "x".repeat(RENDER_BUFFER_CAPACITY * 2);
        assert_eq!(render(&format!("{long}%d"), &[3]), format!("{long}3"));
    }
}
