pub mod scrape_job;
