use clap::{Args, Subcommand};
use floratrack_core::models::schema::known_fields;
use floratrack_core::{Entity, EntityType, Fields, LocalMutation};
use serde_json::Value;
use std::io::{self, Write};

use super::OutputFormat;
use crate::config::Config;
use crate::sync::open_store;

/// CRUD on crops, tasks or orders. Works offline; changes are queued for sync.
#[derive(Args)]
pub struct EntityCommand {
    #[command(subcommand)]
    pub command: EntitySubcommand,
}

#[derive(Subcommand)]
pub enum EntitySubcommand {
    /// Create a new record
    Create {
        /// Field value as KEY=VALUE (repeatable)
        #[arg(long = "set", short = 's', value_name = "KEY=VALUE", required = true)]
        fields: Vec<String>,
    },

    /// List records
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show record details
    Show {
        /// Record ID
        id: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Update fields of a record. KEY= clears an optional field.
    Update {
        /// Record ID
        id: String,

        /// Field value as KEY=VALUE (repeatable)
        #[arg(long = "set", short = 's', value_name = "KEY=VALUE", required = true)]
        fields: Vec<String>,
    },

    /// Delete a record
    Delete {
        /// Record ID
        id: String,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },

    /// List the fields this record type accepts
    Fields,
}

impl EntitySubcommand {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            EntitySubcommand::Create { .. }
                | EntitySubcommand::Update { .. }
                | EntitySubcommand::Delete { .. }
        )
    }

    pub fn is_read(&self) -> bool {
        matches!(
            self,
            EntitySubcommand::List { .. } | EntitySubcommand::Show { .. }
        )
    }
}

impl EntityCommand {
    pub fn run(
        &self,
        entity_type: EntityType,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            EntitySubcommand::Create { fields } => {
                let fields = parse_assignments(fields)?;
                let (file, mut store) = open_store(config)?;
                let id = store.apply_local_mutation(entity_type, LocalMutation::Create { fields })?;
                file.save(&store)?;

                println!("Created {} (pending sync):", entity_type);
                if let Some(entity) = store.get(entity_type, &id) {
                    print_entity(entity);
                }
                Ok(())
            }

            EntitySubcommand::List { format } => {
                let (_, store) = open_store(config)?;
                let entities = store.list(entity_type);

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&entities)?);
                    }
                    OutputFormat::Text => {
                        if entities.is_empty() {
                            println!("No {} found.", entity_type.plural());
                            return Ok(());
                        }
                        for entity in &entities {
                            println!("{}", summary_line(entity));
                        }
                        println!("\n{} {}", entities.len(), entity_type.plural());
                    }
                }
                Ok(())
            }

            EntitySubcommand::Show { id, format } => {
                let (_, store) = open_store(config)?;
                let entity = store
                    .get(entity_type, id)
                    .ok_or_else(|| format!("{} not found: {}", entity_type, id))?;

                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(entity)?),
                    OutputFormat::Text => print_entity(entity),
                }
                Ok(())
            }

            EntitySubcommand::Update { id, fields } => {
                let fields = parse_assignments(fields)?;
                let (file, mut store) = open_store(config)?;
                store.apply_local_mutation(
                    entity_type,
                    LocalMutation::Update {
                        id: id.clone(),
                        fields,
                    },
                )?;
                file.save(&store)?;

                println!("Updated {} (pending sync):", entity_type);
                if let Some(entity) = store.get(entity_type, id) {
                    print_entity(entity);
                }
                Ok(())
            }

            EntitySubcommand::Delete { id, force } => {
                let (file, mut store) = open_store(config)?;
                let label = store
                    .get(entity_type, id)
                    .map(Entity::label)
                    .ok_or_else(|| format!("{} not found: {}", entity_type, id))?;

                if !force {
                    print!("Delete {} '{}' ({})? [y/N] ", entity_type, label, id);
                    io::stdout().flush()?;

                    let mut input = String::new();
                    io::stdin().read_line(&mut input)?;

                    if !input.trim().eq_ignore_ascii_case("y") {
                        println!("Deletion cancelled.");
                        return Ok(());
                    }
                }

                store.apply_local_mutation(entity_type, LocalMutation::Delete { id: id.clone() })?;
                file.save(&store)?;
                println!("Deleted {}: {}", entity_type, label);
                Ok(())
            }

            EntitySubcommand::Fields => {
                for field in known_fields(entity_type) {
                    println!("{}", field);
                }
                Ok(())
            }
        }
    }
}

/// Parses `KEY=VALUE` pairs.
///
/// Values that parse as a JSON number, boolean or quoted string keep that
/// type; anything else is a plain string. An empty value becomes `null`.
fn parse_assignments(assignments: &[String]) -> Result<Fields, String> {
    let mut fields = Fields::new();
    for assignment in assignments {
        let (key, raw) = assignment
            .split_once('=')
            .ok_or_else(|| format!("Invalid field '{}'. Use KEY=VALUE.", assignment))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("Missing field name in '{}'", assignment));
        }
        fields.insert(key.to_string(), parse_value(raw));
    }
    Ok(fields)
}

fn parse_value(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Number(_) | Value::Bool(_) | Value::String(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}

fn sync_marker(entity: &Entity) -> &'static str {
    match (&entity.sync_error, entity.dirty) {
        (Some(_), _) => " [sync failed]",
        (None, true) => " [pending]",
        (None, false) => "",
    }
}

fn summary_line(entity: &Entity) -> String {
    format!(
        "{:<44} v{:<4} {}{}",
        entity.id,
        entity.version,
        entity.label(),
        sync_marker(entity)
    )
}

fn print_entity(entity: &Entity) {
    println!("ID:      {}{}", entity.id, sync_marker(entity));
    println!("Version: {}", entity.version);
    if let Some(updated_at) = entity.updated_at {
        println!("Updated: {}", updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(error) = &entity.sync_error {
        println!("Error:   {}", error);
    }
    println!();
    for (name, value) in &entity.fields {
        match value {
            Value::String(s) => println!("  {}: {}", name, s),
            other => println!("  {}: {}", name, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_assignments_types() {
        let fields = parse_assignments(&[
            "name=Avocado".to_string(),
            "total_quantity=100".to_string(),
            "completed=true".to_string(),
            "planted_date=2024-03-01".to_string(),
            "notes=".to_string(),
            "variety=\"42\"".to_string(),
        ])
        .unwrap();

        assert_eq!(fields["name"], json!("Avocado"));
        assert_eq!(fields["total_quantity"], json!(100));
        assert_eq!(fields["completed"], json!(true));
        assert_eq!(fields["planted_date"], json!("2024-03-01"));
        assert_eq!(fields["notes"], Value::Null);
        assert_eq!(fields["variety"], json!("42"));
    }

    #[test]
    fn test_parse_assignments_keeps_equals_in_value() {
        let fields = parse_assignments(&["notes=pH=6.5".to_string()]).unwrap();
        assert_eq!(fields["notes"], json!("pH=6.5"));
    }

    #[test]
    fn test_parse_assignments_rejects_missing_equals() {
        assert!(parse_assignments(&["name".to_string()]).is_err());
        assert!(parse_assignments(&["=value".to_string()]).is_err());
    }

    #[test]
    fn test_sync_marker() {
        let mut entity = Entity::new(EntityType::Crop, "crop-1", Fields::new());
        assert_eq!(sync_marker(&entity), "");
        entity.dirty = true;
        assert_eq!(sync_marker(&entity), " [pending]");
        entity.sync_error = Some("rejected".to_string());
        assert_eq!(sync_marker(&entity), " [sync failed]");
    }
}
