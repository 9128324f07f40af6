//! Tier maintenance and inspection.

use anyhow::Result;
use colored::Colorize;

use hope_core::KnowledgeManager;

use crate::commands::print_json;

/// Promote eligible cached answers to permanent facts.
pub fn promote(manager: &KnowledgeManager, json: bool) -> Result<()> {
    let promoted = manager.ordinary().check_and_promote(manager.permanent());

    if json {
        return print_json(&promoted);
    }
    if promoted.is_empty() {
        println!("No cached answers are ready for promotion");
        return Ok(());
    }
    println!("{} Promoted {} answer(s)", "✓".green(), promoted.len());
    for fact in &promoted {
        println!("  {} {}  confidence {:.2}", "•".cyan(), fact.id, fact.confidence);
    }
    Ok(())
}

/// Remove expired and already promoted cached answers.
pub fn cleanup(manager: &KnowledgeManager, json: bool) -> Result<()> {
    let removed = manager.ordinary().cleanup_expired();

    if json {
        return print_json(&serde_json::json!({ "removed": removed }));
    }
    println!("{} Removed {} cached answer(s)", "✓".green(), removed);
    Ok(())
}

pub fn stats(manager: &KnowledgeManager, json: bool) -> Result<()> {
    let stats = manager.stats();

    if json {
        return print_json(&stats);
    }

    let state = if stats.enabled { "enabled".green() } else { "disabled".red() };
    println!("{} {}", "HOPE knowledge cache".bold(), state);
    println!();
    println!("{}", "Permanent".cyan().bold());
    println!(
        "  Facts:           {} ({} enabled)",
        stats.permanent.facts, stats.permanent.enabled_facts
    );
    println!("  Skill templates: {}", stats.permanent.skill_templates);
    println!("  Accesses:        {}", stats.permanent.total_accesses);
    println!();
    println!("{}", "Ordinary".cyan().bold());
    println!(
        "  Answers:         {} ({} rated, {} promoted)",
        stats.ordinary.total, stats.ordinary.rated, stats.ordinary.promoted
    );
    println!("  Average rating:  {:.2}", stats.ordinary.average_rating);
    println!("  Accesses:        {}", stats.ordinary.total_accesses);
    println!();
    println!("{}", "Sessions".cyan().bold());
    println!("  Active:          {}", stats.session_cache.active_sessions);
    println!("  Hit rate:        {:.0}%", stats.session_cache.hit_rate * 100.0);
    Ok(())
}

/// List permanent facts.
pub fn facts(manager: &KnowledgeManager, all: bool, json: bool) -> Result<()> {
    let facts: Vec<_> = manager
        .permanent()
        .facts()
        .into_iter()
        .filter(|f| all || f.enabled)
        .collect();

    if json {
        return print_json(&facts);
    }
    if facts.is_empty() {
        println!("No facts");
        return Ok(());
    }
    for fact in &facts {
        let marker = if fact.enabled { "●".green() } else { "○".dimmed() };
        println!(
            "{} {}  {}  confidence {:.2}, {} access(es), +{}/-{}",
            marker,
            fact.id.bold(),
            fact.source.dimmed(),
            fact.confidence,
            fact.access_count,
            fact.positive_feedback,
            fact.negative_feedback
        );
    }
    Ok(())
}
