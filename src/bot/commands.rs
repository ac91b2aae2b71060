use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum Command {
  /// Add a new organization
  Start,
  /// Edit an existing organization: /edit <name>
  Edit(String),
  /// Show the help text
  Help,
  /// Discard the organization being entered or edited
  Cancel,
  /// Retry saving the last organization to Notion
  Retry,
}
