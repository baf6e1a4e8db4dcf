//! Human-readable rendering used in error messages and debugging.

use std::fmt;

use super::expr::{Expr, FragmentPart, Take, WindowRef};
use super::{JoinExpr, OrderByItem, SortDir, Source};

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Field { binding, name } => write!(f, "&{}.{}", binding, name),
            Expr::Binding(ix) => write!(f, "&{}", ix),
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Pin(v) => write!(f, "^{}", v),
            Expr::Dynamic(inner) => write!(f, "^dynamic({})", inner),
            Expr::PinKeyword(pairs) => {
                f.write_str("^[")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("]")
            }
            Expr::Param(ix) => write!(f, "?{}", ix),
            Expr::ParamRange { start, len } => write!(f, "?[{}..{}]", start, start + len),
            Expr::Binary { op, left, right } => {
                write_operand(f, left, *op)?;
                write!(f, " {} ", op.symbol())?;
                write_operand(f, right, *op)
            }
            Expr::Not(inner) => write!(f, "not({})", inner),
            Expr::IsNil(inner) => write!(f, "is_nil({})", inner),
            Expr::In { left, right } => write!(f, "{} in {}", left, right),
            Expr::List(items) => {
                f.write_str("[")?;
                write_list(f, items)?;
                f.write_str("]")
            }
            Expr::Tuple(items) => {
                f.write_str("{")?;
                write_list(f, items)?;
                f.write_str("}")
            }
            Expr::Map(entries) => {
                f.write_str("%{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
            Expr::Call { name, args } => {
                write!(f, "{}(", name)?;
                write_list(f, args)?;
                f.write_str(")")
            }
            Expr::Typed { expr, ty } => write!(f, "type({}, {})", expr, ty),
            Expr::Over { call, window } => match window {
                WindowRef::Named(name) => write!(f, "{} over :{}", call, name),
                WindowRef::Inline(def) => {
                    write!(f, "{} over (partition_by: [", call)?;
                    write_list(f, &def.partition_by)?;
                    f.write_str("], order_by: [")?;
                    write_order_items(f, &def.order_by)?;
                    f.write_str("])")
                }
            },
            Expr::Fragment(parts) => write_fragment(f, parts),
            Expr::Struct { binding, take } => {
                write!(f, "struct(&{}, [", binding)?;
                write_take(f, take)?;
                f.write_str("])")
            }
            Expr::MapOf { binding, take } => {
                write!(f, "map(&{}, [", binding)?;
                write_take(f, take)?;
                f.write_str("])")
            }
            Expr::SelectedAs { expr, name } => write!(f, "selected_as({}, :{})", expr, name),
            Expr::SelectedRef(name) => write!(f, "selected_as(:{})", name),
        }
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, operand: &Expr, parent: super::BinaryOp) -> fmt::Result {
    match operand {
        Expr::Binary { op, .. } if *op != parent => write!(f, "({})", operand),
        _ => write!(f, "{}", operand),
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

fn write_take(f: &mut fmt::Formatter<'_>, take: &[Take]) -> fmt::Result {
    for (i, t) in take.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        match t {
            Take::Field(name) => write!(f, ":{}", name)?,
            Take::Assoc(name, nested) => {
                write!(f, "{}: [", name)?;
                write_take(f, nested)?;
                f.write_str("]")?;
            }
        }
    }
    Ok(())
}

pub(crate) fn write_fragment(f: &mut fmt::Formatter<'_>, parts: &[FragmentPart]) -> fmt::Result {
    f.write_str("fragment(\"")?;
    let mut args = Vec::new();
    for part in parts {
        match part {
            FragmentPart::Raw(text) => f.write_str(text)?,
            FragmentPart::Expr(e) => {
                f.write_str("?")?;
                args.push(e);
            }
        }
    }
    f.write_str("\"")?;
    for arg in args {
        write!(f, ", {}", arg)?;
    }
    f.write_str(")")
}

fn write_order_items(f: &mut fmt::Formatter<'_>, items: &[OrderByItem]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for OrderByItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dir {
            SortDir::Asc => write!(f, "asc: {}", self.expr),
            SortDir::Desc => write!(f, "desc: {}", self.expr),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Table(table) => write!(f, "{:?}", table),
            Source::SchemaTable { schema, .. } => f.write_str(schema),
            Source::Subquery(_) => f.write_str("subquery(...)"),
            Source::Fragment(parts) => write_fragment(f, parts),
        }
    }
}

impl fmt::Display for JoinExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_join: ", self.qual.as_str())?;
        match (&self.assoc, &self.source) {
            (Some(assoc), _) => write!(f, "assoc(&{}, :{})", assoc.parent, assoc.name)?,
            (None, Some(source)) => write!(f, "{}", source)?,
            (None, None) => f.write_str("nil")?,
        }
        if let Some(on) = &self.on {
            write!(f, ", on: {}", on)?;
        }
        Ok(())
    }
}
