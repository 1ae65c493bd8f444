//! Catalog items (`productos`).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use super::{decode_all, lenient_f64, lenient_i64, lenient_strings};
use crate::remote::{Direction, Filter, Query};
use crate::sync::{CollectionSpec, Entity, Schema, SyncClient, SyncResult};

/// Backend collection name
pub const PRODUCTS: &str = "productos";

/// Product line used when none is stored
pub const DEFAULT_LINE: &str = "cremas hidratantes";

const PROMOTION_FLAG: &str = "si";

pub fn spec() -> CollectionSpec {
    CollectionSpec::new(PRODUCTS).with_schema(
        Schema::new()
            .list("uso")
            .timestamp("createdAt")
            .timestamp("updatedAt"),
    )
}

fn default_line() -> String {
    DEFAULT_LINE.to_string()
}

/// A catalog item as shown in the storefront
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    #[serde(rename = "nombre", default)]
    pub name: String,
    #[serde(rename = "precio", default, deserialize_with = "lenient_f64")]
    pub price: f64,
    #[serde(rename = "categoria", default)]
    pub category: String,
    #[serde(rename = "descripcion", default)]
    pub description: String,
    #[serde(rename = "imagen", default)]
    pub image: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub stock: i64,
    #[serde(rename = "linea", default = "default_line")]
    pub line: String,
    #[serde(rename = "promocion", default)]
    pub promotion: String,
    #[serde(rename = "uso", default, deserialize_with = "lenient_strings")]
    pub usage: Vec<String>,
}

impl Product {
    pub fn is_promotion(&self) -> bool {
        self.promotion.trim().eq_ignore_ascii_case(PROMOTION_FLAG)
    }

    pub fn is_available(&self) -> bool {
        self.stock > 0
    }
}

/// Every product in the latest snapshot, in backend order
pub fn all(client: &SyncClient) -> Vec<Product> {
    client.view(PRODUCTS, decode_all::<Product>)
}

pub fn in_promotion(products: &[Product]) -> Vec<Product> {
    products.iter().filter(|p| p.is_promotion()).cloned().collect()
}

/// Products of one category, compared case-insensitively
pub fn by_category(products: &[Product], category: &str) -> Vec<Product> {
    let wanted = category.trim().to_lowercase();
    products
        .iter()
        .filter(|p| p.category.trim().to_lowercase() == wanted)
        .cloned()
        .collect()
}

/// Stable sort by price
pub fn sorted_by_price(products: &[Product], direction: Direction) -> Vec<Product> {
    let mut sorted = products.to_vec();
    sorted.sort_by(|a, b| {
        let ord = a.price.total_cmp(&b.price);
        match direction {
            Direction::Ascending => ord,
            Direction::Descending => ord.reverse(),
        }
    });
    sorted
}

/// Distinct non-empty categories, sorted
pub fn categories(products: &[Product]) -> Vec<String> {
    products
        .iter()
        .map(|p| p.category.trim())
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// One-shot query for products flagged as promotions
pub fn promotions_query() -> Query {
    Query::all().filter(Filter::eq("promocion", PROMOTION_FLAG))
}

/// Read the current promotions once, without touching the live store
pub async fn fetch_promotions(client: &SyncClient) -> SyncResult<Vec<Product>> {
    let entities = client.query_once(PRODUCTS, &promotions_query()).await?;
    Ok(decode_all(&dedupe(entities)))
}

/// Keep the first entity of each id
fn dedupe(entities: Vec<Entity>) -> Vec<Entity> {
    let mut seen = HashSet::new();
    entities
        .into_iter()
        .filter(|e| seen.insert(e.id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{BackendValue, Fields, MemoryBackend};
    use serde_json::{json, Map};
    use std::sync::Arc;

    fn product(name: &str, price: f64, category: &str, promo: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("nombre".into(), name.into());
        fields.insert("precio".into(), price.into());
        fields.insert("categoria".into(), category.into());
        fields.insert("promocion".into(), promo.into());
        fields.insert("stock".into(), BackendValue::Integer(4));
        fields
    }

    fn seeded() -> (Arc<MemoryBackend>, SyncClient) {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(PRODUCTS, "p1", product("Crema", 25.0, "Rostro", "si"));
        backend.seed(PRODUCTS, "p2", product("Gel", 10.5, "Cuerpo", "no"));
        backend.seed(PRODUCTS, "p3", product("Serum", 40.0, "rostro", "SI"));
        let client = SyncClient::new(backend.clone());
        client.register(spec());
        (backend, client)
    }

    #[test]
    fn test_decode_with_defaults() {
        let entity: Entity = serde_json::from_value(json!({
            "id": "p1",
            "nombre": "Crema",
            "precio": "19.90",
            "stock": "3",
            "uso": "noche, dia"
        }))
        .unwrap();

        let product: Product = entity.decode().unwrap();
        assert_eq!(product.price, 19.9);
        assert_eq!(product.stock, 3);
        assert_eq!(product.line, DEFAULT_LINE);
        assert_eq!(product.usage, vec!["noche", "dia"]);
        assert!(!product.is_promotion());
    }

    #[test]
    fn test_views_over_live_snapshot() {
        let (_backend, client) = seeded();
        client.subscribe(PRODUCTS).unwrap();

        let products = all(&client);
        assert_eq!(products.len(), 3);
        // Absent `uso` was normalized to an empty list
        assert!(products.iter().all(|p| p.usage.is_empty()));

        let promos: Vec<_> = in_promotion(&products).into_iter().map(|p| p.id).collect();
        assert_eq!(promos, vec!["p1", "p3"]);

        assert_eq!(by_category(&products, "ROSTRO").len(), 2);
        assert_eq!(categories(&products), vec!["Cuerpo", "Rostro", "rostro"]);

        let cheapest: Vec<_> = sorted_by_price(&products, Direction::Ascending)
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(cheapest, vec!["p2", "p1", "p3"]);

        // Views never reorder the store
        assert_eq!(client.get_all(PRODUCTS)[0].id, "p1");
    }

    #[tokio::test]
    async fn test_fetch_promotions_is_exact_match() {
        let (_backend, client) = seeded();

        let promos = fetch_promotions(&client).await.unwrap();

        // The backend filter is an exact match, unlike the view
        assert_eq!(promos.len(), 1);
        assert_eq!(promos[0].name, "Crema");
        assert!(client.get_all(PRODUCTS).is_empty());
    }

    #[test]
    fn test_dedupe_keeps_first() {
        let first = Entity::new("p1", Map::new());
        let mut later = Map::new();
        later.insert("nombre".into(), json!("dup"));
        let deduped = dedupe(vec![first.clone(), Entity::new("p1", later), Entity::new("p2", Map::new())]);

        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0], first);
    }
}
