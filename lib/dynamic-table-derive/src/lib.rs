use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, parse_macro_input};

/// Options read from `#[column(...)]` on a record field.
#[derive(Default)]
struct ColumnAttr {
    skip: bool,
    name: Option<String>,
}

fn column_attr(field: &syn::Field) -> syn::Result<ColumnAttr> {
    let mut parsed = ColumnAttr::default();
    for attr in field.attrs.iter().filter(|a| a.path().is_ident("column")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                parsed.skip = true;
                Ok(())
            } else if meta.path.is_ident("name") {
                let lit: syn::LitStr = meta.value()?.parse()?;
                parsed.name = Some(lit.value());
                Ok(())
            } else {
                Err(meta.error("expected `skip` or `name = \"...\"`"))
            }
        })?;
    }
    Ok(parsed)
}

/// Map a Rust type to a `ColumnType` variant name and its nullability.
fn rust_type_to_column_type(ty: &syn::Type) -> (&'static str, bool) {
    let type_str = quote::quote!(#ty).to_string();
    // Remove spaces for easier matching
    let type_str = type_str.replace(' ', "");

    // Check for Option<T> - extract inner type
    let (inner_type, nullable) = if type_str.starts_with("Option<") && type_str.ends_with('>') {
        (&type_str[7..type_str.len() - 1], true)
    } else {
        (type_str.as_str(), false)
    };

    let column_type = match inner_type {
        // Datetime types
        s if s.contains("StorageDatetime") => "Timestamp",
        s if s.contains("DateTime") => "Timestamp",
        // Integer types
        "u64" | "i64" | "u32" | "i32" | "usize" | "isize" => "BigInt",
        "f64" | "f32" => "Double",
        // Boolean
        "bool" => "Boolean",
        // Structured values
        s if s.contains("Value") || s.starts_with("Vec<") || s.contains("Map<") => "Json",
        // Default to text for String and everything else
        _ => "Text",
    };

    (column_type, nullable)
}

/// Parse #[storable(table = "...")] attribute and return table name
fn parse_storable_attr(input: &DeriveInput) -> Option<String> {
    for attr in &input.attrs {
        if attr.path().is_ident("storable") {
            let mut table_name = None;
            let _ = attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("table") {
                    let lit: syn::LitStr = meta.value()?.parse()?;
                    table_name = Some(lit.value());
                }
                Ok(())
            });
            return table_name;
        }
    }
    None
}

/// Derive macro for the `Storable` trait of catalog records.
///
/// The struct must carry `#[storable(table = "...")]` and an `id: i64`
/// field, which becomes the serial primary key. Every other named field maps
/// to a column of the same name; `Option<T>` fields are nullable.
///
/// Use `#[column(skip)]` to exclude a field from database storage.
/// Use `#[column(name = "custom_name")]` to override the column name.
///
/// ## Example
///
/// ```text
/// #[derive(Clone, Serialize, Deserialize, Storable)]
/// #[storable(table = "database_selectoption")]
/// pub struct SelectOptionRecord {
///     pub id: i64,
///     pub field_id: i64,
///     pub value: String,
///     pub color: String,
///     pub order: i64,
/// }
/// ```
#[proc_macro_derive(Storable, attributes(storable, column))]
pub fn derive_storable(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return syn::Error::new_spanned(name, "Storable requires named fields")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new_spanned(name, "Storable can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let Some(table_name) = parse_storable_attr(&input) else {
        return syn::Error::new_spanned(name, "missing #[storable(table = \"...\")] attribute")
            .to_compile_error()
            .into();
    };

    let mut has_id = false;
    let mut column_names: Vec<String> = Vec::new();
    let mut column_types: Vec<TokenStream2> = Vec::new();
    let mut nullable: Vec<bool> = Vec::new();
    let mut json_keys: Vec<String> = Vec::new();

    for field in fields.iter() {
        let attr = match column_attr(field) {
            Ok(attr) => attr,
            Err(e) => return e.to_compile_error().into(),
        };
        if attr.skip {
            continue;
        }

        let Some(field_name) = field.ident.as_ref() else {
            continue;
        };
        let json_key = field_name.to_string();
        let col_name = attr.name.unwrap_or_else(|| json_key.clone());

        let (variant, is_nullable) = if json_key == "id" {
            has_id = true;
            ("Serial", false)
        } else {
            rust_type_to_column_type(&field.ty)
        };
        let variant = format_ident!("{}", variant);

        column_names.push(col_name);
        column_types.push(quote! { dynamic_table::ColumnType::#variant });
        nullable.push(is_nullable);
        json_keys.push(json_key);
    }

    if !has_id {
        return syn::Error::new_spanned(name, "Storable records need an `id: i64` field")
            .to_compile_error()
            .into();
    }

    let column_literals: Vec<_> = column_names.iter().map(|s| s.as_str()).collect();
    let json_key_literals: Vec<_> = json_keys.iter().map(|s| s.as_str()).collect();

    let expanded = quote! {
        impl dynamic_table::Storable for #name {
            fn table_name() -> &'static str {
                #table_name
            }

            fn columns() -> &'static [&'static str] {
                &[#(#column_literals),*]
            }

            fn column_types() -> &'static [dynamic_table::ColumnType] {
                &[#(#column_types),*]
            }

            fn nullable() -> &'static [bool] {
                &[#(#nullable),*]
            }

            fn json_keys() -> &'static [&'static str] {
                &[#(#json_key_literals),*]
            }

            fn id(&self) -> i64 {
                self.id
            }
        }
    };

    TokenStream::from(expanded)
}
