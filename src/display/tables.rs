//! Table formatting for search, clustering and projection output.

use comfy_table::{
    Attribute, Cell, CellAlignment, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL,
};

use crate::vector::{KMeansResult, Projection, SearchHit};

/// Builder for creating formatted tables.
pub struct TableBuilder {
    table: Table,
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    pub fn new() -> Self {
        Self { table: styled() }
    }

    pub fn set_headers(mut self, headers: Vec<&str>) -> Self {
        self.table.set_header(header(&headers));
        self
    }

    pub fn add_row(mut self, row: Vec<String>) -> Self {
        self.table.add_row(row);
        self
    }

    pub fn build(self) -> String {
        self.table.to_string()
    }
}

fn styled() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.apply_modifier(UTF8_ROUND_CORNERS);
    table
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|name| Cell::new(name).add_attribute(Attribute::Bold))
        .collect()
}

/// Ranked search hits. Scores at or above 0.9 are highlighted.
pub fn create_search_table(hits: &[SearchHit]) -> String {
    let mut table = styled();
    table.set_header(header(&["Rank", "Id", "Score"]));

    for (rank, hit) in hits.iter().enumerate() {
        let color = if hit.score.get() >= 0.9 {
            Color::Green
        } else {
            Color::Reset
        };
        table.add_row(vec![
            Cell::new(rank + 1).set_alignment(CellAlignment::Right),
            Cell::new(&hit.id),
            Cell::new(hit.score.to_string()).fg(color),
        ]);
    }
    table.to_string()
}

/// One row per cluster: size and a few member ids.
pub fn create_cluster_table(result: &KMeansResult, ids: &[&str], sample: usize) -> String {
    let mut table = styled();
    table.set_header(header(&["Cluster", "Size", "Members"]));

    let sizes = result.cluster_sizes();
    for (cluster, size) in sizes.iter().enumerate() {
        let members: Vec<&str> = result
            .labels
            .iter()
            .zip(ids)
            .filter(|(label, _)| **label == cluster)
            .map(|(_, id)| *id)
            .take(sample)
            .collect();
        let mut listing = members.join(", ");
        if *size > members.len() {
            listing.push_str(", ...");
        }
        table.add_row(vec![cluster.to_string(), size.to_string(), listing]);
    }

    let converged = if result.converged { "yes" } else { "no" };
    table.add_row(vec![
        Cell::new("inertia").add_attribute(Attribute::Bold),
        Cell::new(format!("{:.4}", result.inertia)),
        Cell::new(format!(
            "{} iterations, converged: {converged}",
            result.iterations
        )),
    ]);
    table.to_string()
}

/// Explained variance and range per axis, then up to `limit` points.
pub fn create_projection_table(projection: &Projection, limit: usize) -> String {
    let meta = projection.meta();
    let mut table = styled();
    table.set_header(header(&["Id", "x", "y", "z"]));

    table.add_row(vec![
        Cell::new("explained").add_attribute(Attribute::Bold),
        Cell::new(format!("{:.3}", meta.explained_variance[0])),
        Cell::new(format!("{:.3}", meta.explained_variance[1])),
        Cell::new(format!("{:.3}", meta.explained_variance[2])),
    ]);
    for point in projection.points().iter().take(limit) {
        table.add_row(vec![
            point.id.clone(),
            format!("{:+.4}", point.position[0]),
            format!("{:+.4}", point.position[1]),
            format!("{:+.4}", point.position[2]),
        ]);
    }
    if projection.len() > limit {
        table.add_row(vec![
            format!("... {} more", projection.len() - limit),
            String::new(),
            String::new(),
            String::new(),
        ]);
    }
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{Projector, Score, VectorStore, kmeans};

    #[test]
    fn test_table_builder() {
        let table = TableBuilder::new()
            .set_headers(vec!["Column 1", "Column 2"])
            .add_row(vec!["Value 1".to_string(), "Value 2".to_string()])
            .build();

        assert!(table.contains("Column 1"));
        assert!(table.contains("Value 1"));
    }

    #[test]
    fn test_search_table_lists_hits() {
        let hits = vec![
            SearchHit {
                id: "alpha".to_string(),
                score: Score::saturating(0.95),
            },
            SearchHit {
                id: "beta".to_string(),
                score: Score::saturating(0.5),
            },
        ];
        let table = create_search_table(&hits);
        assert!(table.contains("alpha"));
        assert!(table.contains("0.5000"));
    }

    #[test]
    fn test_cluster_table_truncates_members() {
        let vectors = vec![
            vec![1.0, 0.0],
            vec![0.9, 0.1],
            vec![0.95, 0.05],
            vec![0.0, 1.0],
        ];
        let result = kmeans(&vectors, 2, 50, 1e-4).unwrap();
        let ids = ["a", "b", "c", "d"];
        let table = create_cluster_table(&result, &ids, 1);
        assert!(table.contains("..."));
        assert!(table.contains("inertia"));
    }

    #[test]
    fn test_projection_table_limit() {
        let mut store = VectorStore::new();
        store.ingest_batch((0..6).map(|i| (format!("p{i}"), vec![i as f32, 1.0, -(i as f32)])));
        let projection = Projector::default().project(&store);
        let table = create_projection_table(&projection, 2);
        assert!(table.contains("explained"));
        assert!(table.contains("4 more"));
    }
}
