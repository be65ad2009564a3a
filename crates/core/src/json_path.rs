/// Splits a dot-separated field path into its segments.
///
/// `\.` is a literal dot inside a segment. `\\` directly in front of a `.` is a literal
/// backslash that ends the segment. Any other backslash is kept as is. Array indexing
/// is not supported. The empty path has no segments.
pub fn parse_simple_json_path(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    if path.is_empty() {
        return out;
    }
    let chars: Vec<char> = path.chars().collect();
    let mut cur = String::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => match (chars.get(i + 1), chars.get(i + 2)) {
                (Some('.'), _) => {
                    cur.push('.');
                    i += 1;
                }
                (Some('\\'), Some('.')) => {
                    cur.push('\\');
                    i += 1;
                }
                _ => cur.push('\\'),
            },
            '.' => out.push(std::mem::take(&mut cur)),
            c => cur.push(c),
        }
        i += 1;
    }
    out.push(cur);
    out
}
