use std::io::Write;

/// Write one top-N side snapshot (TSV by default, `--json` via manual
/// `ryu`-backed formatting to avoid a `serde_json::to_string` allocation on
/// the hot print path, matching the teacher's `handle_message`).
pub fn print_side<W: Write>(
    market: &str,
    side: &str,
    levels: &[(String, f64)],
    json_mode: bool,
    buf: &mut String,
    writer: &mut W,
) -> std::io::Result<()> {
    buf.clear();

    if json_mode {
        buf.push_str("{\"market\":\"");
        buf.push_str(market);
        buf.push_str("\",\"side\":\"");
        buf.push_str(side);
        buf.push_str("\",\"levels\":[");
        for (i, (price, qty)) in levels.iter().enumerate() {
            if i > 0 {
                buf.push(',');
            }
            buf.push_str("[\"");
            buf.push_str(price);
            buf.push_str("\",");
            format_f64(buf, *qty);
            buf.push(']');
        }
        buf.push_str("]}");
    } else {
        buf.push_str(market);
        buf.push('\t');
        buf.push_str(side);
        for (price, qty) in levels {
            buf.push('\t');
            buf.push_str(price);
            buf.push(':');
            format_f64(buf, *qty);
        }
    }

    buf.push('\n');
    writer.write_all(buf.as_bytes())?;
    writer.flush()
}

/// Fast f64 formatting via `ryu`.
fn format_f64(buf: &mut String, val: f64) {
    let mut b = ryu::Buffer::new();
    buf.push_str(b.format(val));
}

/// Fast u64 formatting (avoids `format!` allocation), used for sequence
/// counters in the multi-market summary table.
pub fn write_u64(buf: &mut String, mut val: u64) {
    if val == 0 {
        buf.push('0');
        return;
    }
    let mut digits = [0u8; 20];
    let mut i = digits.len();
    while val > 0 {
        i -= 1;
        digits[i] = b'0' + (val % 10) as u8;
        val /= 10;
    }
    // SAFETY: digits 0-9 are valid UTF-8
    buf.push_str(unsafe { std::str::from_utf8_unchecked(&digits[i..]) });
}

/// `print_summary`-style table: one line per market showing sync state and
/// book depth, reduced from the original's richer terminal dashboard to a
/// plain tracing-friendly table.
pub fn print_summary<W: Write>(
    rows: &[(String, bool, usize, usize)],
    buf: &mut String,
    writer: &mut W,
) -> std::io::Result<()> {
    buf.clear();
    buf.push_str("market\tsynchronized\tasks\tbids\n");
    for (market, synchronized, ask_count, bid_count) in rows {
        buf.push_str(market);
        buf.push('\t');
        buf.push_str(if *synchronized { "yes" } else { "no" });
        buf.push('\t');
        write_u64(buf, *ask_count as u64);
        buf.push('\t');
        write_u64(buf, *bid_count as u64);
        buf.push('\n');
    }
    writer.write_all(buf.as_bytes())?;
    writer.flush()
}
