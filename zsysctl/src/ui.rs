use comfy_table::presets::ASCII_NO_BORDERS;
use comfy_table::*;
use slog_scope::info;

/// Render a flat "field: value" table, the same layout the teacher's
/// `print_comfy_info` used for single-record detail views.
pub fn print_comfy_info(rows: Vec<(Cell, Cell)>) {
    let mut table = Table::new();
    table
        .load_preset(ASCII_NO_BORDERS)
        .remove_style(TableComponent::HorizontalLines)
        .remove_style(TableComponent::VerticalLines)
        .remove_style(TableComponent::MiddleIntersections)
        .set_content_arrangement(ContentArrangement::Dynamic);

    for (header, value) in rows {
        table.add_row(vec![header, value]);
    }

    info!(#"zsysctl_raw", "{}", table);
}

pub fn comfy_identifier_header(name: &str) -> Cell {
    Cell::new(name).add_attribute(Attribute::Bold)
}

pub fn comfy_name_value<T: ToString>(name: T) -> Cell {
    Cell::new(name).fg(Color::Blue)
}

/// Print the collateral-removal list from a `RemovalPlan`'s wire form and
/// ask the operator to confirm before the caller re-issues the request with
/// `force=true`. Returns `false` without prompting when there is nothing
/// collateral to confirm.
pub fn confirm_removal(collateral: &[String], forced: &[String]) -> anyhow::Result<bool> {
    if collateral.is_empty() && forced.is_empty() {
        return Ok(true);
    }
    if !collateral.is_empty() {
        println!("the following will also be removed:");
        for name in collateral {
            println!("  {}", name);
        }
    }
    if !forced.is_empty() {
        println!("the following user states will be dissociated:");
        for name in forced {
            println!("  {}", name);
        }
    }
    Ok(dialoguer::Confirmation::new()
        .with_text("proceed?")
        .default(false)
        .interact()?)
}
