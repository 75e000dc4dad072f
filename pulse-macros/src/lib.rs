use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod event_payload;
mod utils;

/// 事件载荷派生宏
///
/// 为结构体或枚举实现 `::pulse_core::event::EventPayload`：
/// - 结构体：`#[event(event_type = "job.run", priority = 5)]`，缺省类型名为结构体名；
/// - 枚举：每个变体可用 `#[event(event_type = "...", priority = N)]` 覆写，
///   缺省类型名为 `EnumName.Variant`；枚举级 `#[event(priority = N)]` 作为变体默认优先级，
///   枚举级不允许设置 `event_type`。
///
/// 类型需同时实现 `serde::Serialize`。
#[proc_macro_derive(EventPayload, attributes(event))]
pub fn derive_event_payload(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    event_payload::expand(input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}
