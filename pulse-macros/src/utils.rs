use syn::{Attribute, Expr, LitStr, Result};

/// `#[event(...)]` 中解析出的键值
#[derive(Default)]
pub(crate) struct EventAttr {
    pub(crate) event_type: Option<LitStr>,
    pub(crate) priority: Option<Expr>,
}

/// 合并同一位置上的全部 `#[event(...)]`，重复键报错
pub(crate) fn parse_event_attrs(attrs: &[Attribute]) -> Result<EventAttr> {
    let mut out = EventAttr::default();

    for attr in attrs.iter().filter(|a| a.path().is_ident("event")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("event_type") {
                if out.event_type.is_some() {
                    return Err(meta.error("duplicate 'event_type'"));
                }
                let lit: LitStr = meta.value()?.parse()?;
                if lit.value().trim().is_empty() {
                    return Err(syn::Error::new(lit.span(), "'event_type' must not be empty"));
                }
                out.event_type = Some(lit);
                Ok(())
            } else if meta.path.is_ident("priority") {
                if out.priority.is_some() {
                    return Err(meta.error("duplicate 'priority'"));
                }
                out.priority = Some(meta.value()?.parse()?);
                Ok(())
            } else {
                Err(meta.error("unsupported key, expected 'event_type' or 'priority'"))
            }
        })?;
    }

    Ok(out)
}
