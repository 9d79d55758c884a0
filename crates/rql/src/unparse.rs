use super::Expr;

/// Render an expression back into the URL mini-language.
///
/// `asc`/`desc` nodes render as signed binds, so `parse` and `unparse`
/// round-trip: `unparse(parse(q)) == q` for canonical inputs.
pub fn unparse(expr: &Expr) -> String {
    let mut out = String::new();
    write(expr, &mut out);
    out
}

fn write(expr: &Expr, out: &mut String) {
    match expr {
        Expr::Value(value) => out.push_str(&value.to_string()),
        Expr::Bind(place) => out.push_str(place),
        Expr::Op { name, args } => match (name.as_str(), args.as_slice()) {
            ("asc", [Expr::Bind(place)]) => {
                out.push('+');
                out.push_str(place);
            }
            ("desc", [Expr::Bind(place)]) => {
                out.push('-');
                out.push_str(place);
            }
            _ => {
                out.push_str(name);
                out.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(arg, out);
                }
                out.push(')');
            }
        },
    }
}
